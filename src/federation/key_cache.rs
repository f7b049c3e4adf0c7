//! Issuer public key caching
//!
//! Caches peer public keys fetched from their well-known endpoint to
//! reduce remote requests during token verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    /// TTL for this entry
    ttl: Duration,
}

impl CachedKey {
    /// Check if this cache entry is still valid
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Issuer public key cache
///
/// Thread-safe cache keyed by issuer base URL. On first contact the key
/// is fetched from the issuer's well-known endpoint and cached.
pub struct IssuerKeyCache {
    /// Cache storage: issuer URL -> cached key
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    /// HTTP client for fetching keys
    http_client: Arc<reqwest::Client>,
    /// Default TTL for cached keys
    default_ttl: Duration,
}

impl IssuerKeyCache {
    /// Create new issuer key cache
    ///
    /// # Arguments
    /// * `http_client` - HTTP client for fetching keys
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    pub fn new(http_client: Arc<reqwest::Client>, default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            http_client,
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get the public key for an issuer.
    ///
    /// Checks cache first, fetches from the issuer's well-known endpoint
    /// if not cached or expired.
    ///
    /// # Returns
    /// PEM-encoded public key
    pub async fn get(&self, issuer: &str) -> Result<String, AppError> {
        // 1. Check cache (read lock)
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(issuer) {
                if cached.is_valid() {
                    tracing::debug!("Issuer key cache hit for {}", issuer);
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Issuer key cache expired for {}", issuer);
            }
        }

        // 2. Cache miss or expired - fetch from remote
        tracing::debug!("Issuer key cache miss for {}, fetching...", issuer);
        let pem = fetch_issuer_key(issuer, &self.http_client).await?;

        // 3. Update cache (write lock)
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                issuer.to_string(),
                CachedKey {
                    pem: pem.clone(),
                    cached_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }

        Ok(pem)
    }

    /// Seed a key without fetching.
    ///
    /// Used at startup for the local instance and by tests.
    pub async fn seed(&self, issuer: &str, pem: String) {
        let mut cache = self.cache.write().await;
        cache.insert(
            issuer.to_string(),
            CachedKey {
                pem,
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, issuer: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(issuer);
        tracing::debug!("Invalidated issuer key cache for {}", issuer);
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, v| v.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired issuer key cache entries", removed);
        }
    }
}

/// Fetch an issuer's public key from its well-known endpoint.
async fn fetch_issuer_key(
    issuer: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let url = format!("{}/.well-known/lagoon", issuer.trim_end_matches('/'));

    let response = http_client
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to fetch issuer key: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Issuer {} returned HTTP {} for well-known",
            issuer,
            response.status()
        )));
    }

    let descriptor: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid well-known document: {}", e)))?;

    descriptor
        .get("publicKeyPem")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::Federation(format!("Issuer {} well-known lacks publicKeyPem", issuer))
        })
}
