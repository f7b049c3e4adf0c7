//! Federation pull/cursor protocol
//!
//! Peer-to-peer incremental sync. The requester signs a short-lived
//! bearer token; the remote verifies it against the issuer's published
//! public key, enforces scope/audience/expiry, and rejects replays via
//! nonce tracking. Progress is tracked with an opaque cursor per
//! (viewer, circle, remote domain), invalidated by a hash over the
//! normalized actor and filter sets.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::Database;
use crate::error::AppError;
use crate::federation::key_cache::IssuerKeyCache;
use crate::metrics::{PULL_TOKENS_VERIFIED_TOTAL, REPLAYS_REJECTED_TOTAL};

/// Scope carried by every pull token.
pub const PULL_SCOPE: &str = "federation:pull";

/// Claims inside a pull token.
///
/// Token format: `base64url(claims JSON).base64url(rsa_sha256(claims))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullClaims {
    /// Issuer: the requesting server's base URL
    pub iss: String,
    /// Audience: the verifying server's base URL
    pub aud: String,
    pub scope: String,
    /// Server or server-actor id of the requester
    pub sub: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds); at most 60s after iat
    pub exp: i64,
}

/// Result of a successful token verification
#[derive(Debug, Clone)]
pub struct VerifiedPull {
    /// Domain of the verified issuer
    pub domain: String,
    pub claims: PullClaims,
}

/// Pull protocol configuration and state.
pub struct PullProtocol {
    db: Arc<Database>,
    key_cache: Arc<IssuerKeyCache>,
    http_client: Arc<reqwest::Client>,
    /// This server's base URL, used as `iss` when signing and `aud` when
    /// verifying
    local_base_url: String,
    /// Server-actor id placed in `sub`
    subject: String,
    private_key_pem: String,
    token_ttl_seconds: i64,
    nonce_ttl_seconds: i64,
    audience_cap: usize,
}

impl PullProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        key_cache: Arc<IssuerKeyCache>,
        http_client: Arc<reqwest::Client>,
        local_base_url: String,
        subject: String,
        private_key_pem: String,
        token_ttl_seconds: i64,
        nonce_ttl_seconds: i64,
        audience_cap: usize,
    ) -> Self {
        Self {
            db,
            key_cache,
            http_client,
            local_base_url,
            subject,
            private_key_pem,
            token_ttl_seconds,
            nonce_ttl_seconds,
            audience_cap,
        }
    }

    /// Sign a short-lived bearer token for a pull request to `audience`.
    pub fn sign_pull_token(&self, audience: &str) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = PullClaims {
            iss: self.local_base_url.clone(),
            aud: audience.to_string(),
            scope: PULL_SCOPE.to_string(),
            sub: self.subject.clone(),
            iat: now,
            exp: now + self.token_ttl_seconds,
        };

        let payload =
            serde_json::to_string(&claims).map_err(|e| AppError::Internal(e.into()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());

        let private_key = RsaPrivateKey::from_pkcs8_pem(&self.private_key_pem)
            .map_err(|e| AppError::Config(format!("Invalid instance private key: {}", e)))?;
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, payload_b64.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{}.{}", payload_b64, signature_b64))
    }

    /// Verify an inbound pull token.
    ///
    /// Checks, in order: token shape, claims decoding, scope, audience,
    /// expiry, issuer key signature, and nonce freshness. A request
    /// failing any check is rejected outright, never partially trusted.
    pub async fn verify_pull_token(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> Result<VerifiedPull, AppError> {
        match self.verify_inner(token, expected_audience).await {
            Ok(verified) => {
                PULL_TOKENS_VERIFIED_TOTAL
                    .with_label_values(&["accepted"])
                    .inc();
                Ok(verified)
            }
            Err(error) => {
                PULL_TOKENS_VERIFIED_TOTAL
                    .with_label_values(&["rejected"])
                    .inc();
                Err(error)
            }
        }
    }

    async fn verify_inner(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> Result<VerifiedPull, AppError> {
        // 1. Split token into payload and signature
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or(AppError::InvalidSignature)?;

        // 2. Decode and deserialize claims
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AppError::InvalidSignature)?;
        let claims: PullClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AppError::InvalidSignature)?;

        // 3. Scope and audience
        if claims.scope != PULL_SCOPE {
            return Err(AppError::Forbidden(format!(
                "Token scope {} is not {}",
                claims.scope, PULL_SCOPE
            )));
        }
        if claims.aud != expected_audience {
            return Err(AppError::Forbidden(format!(
                "Token audience {} does not match {}",
                claims.aud, expected_audience
            )));
        }

        // 4. Expiry. An expired token cannot be replayed to resume a
        // stale pull.
        let now = Utc::now().timestamp();
        if claims.exp <= now {
            return Err(AppError::Replay("expired pull token".to_string()));
        }
        if claims.exp - claims.iat > 60 {
            return Err(AppError::Forbidden(
                "Token lifetime exceeds 60 seconds".to_string(),
            ));
        }

        let issuer_domain = issuer_domain(&claims.iss)?;

        // 5. Resolve the issuer's public key (well-known, cached) and
        // verify the signature.
        let public_key_pem = self.key_cache.get(&claims.iss).await?;
        let public_key = RsaPublicKey::from_public_key_pem(&public_key_pem)
            .map_err(|e| AppError::Federation(format!("Invalid issuer public key: {}", e)))?;
        let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AppError::InvalidSignature)?;
        let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
            .map_err(|_| AppError::InvalidSignature)?;

        verifier
            .verify(payload_b64.as_bytes(), &signature)
            .map_err(|_| AppError::InvalidSignature)?;

        // 6. Nonce: a repeat of the same signature hash before expiry is
        // a replay.
        let signature_hash = URL_SAFE_NO_PAD.encode(Sha256::digest(&signature_bytes));
        let expires_at = Utc::now() + chrono::Duration::seconds(self.nonce_ttl_seconds);
        let fresh = self.db.record_nonce(&signature_hash, expires_at).await?;
        if !fresh {
            REPLAYS_REJECTED_TOTAL.inc();
            return Err(AppError::Replay(format!(
                "signature hash {} seen before expiry",
                signature_hash
            )));
        }

        Ok(VerifiedPull {
            domain: issuer_domain,
            claims,
        })
    }

    /// Local viewers that should receive content from `remote_domain`:
    /// anyone following one of the named remote actors, or the domain
    /// itself via `@domain`. Deduplicated, capped, and sorted
    /// deterministically. The ordering feeds the state hash, not a UI.
    pub async fn pull_audience(
        &self,
        remote_domain: &str,
        remote_actors: &[String],
    ) -> Result<Vec<String>, AppError> {
        let mut follow_targets: Vec<String> = remote_actors.to_vec();
        follow_targets.push(format!("@{}", remote_domain));

        let mut viewers = self.db.local_followers_of(&follow_targets).await?;
        viewers.sort();
        viewers.dedup();
        viewers.truncate(self.audience_cap);
        Ok(viewers)
    }

    /// Stored cursor position, honored only while the state hash still
    /// matches; a changed actor or filter set invalidates the cursor
    /// without deleting history.
    pub async fn cursor_since(
        &self,
        viewer_id: &str,
        circle_id: &str,
        remote_domain: &str,
        state_hash: &str,
    ) -> Result<Option<String>, AppError> {
        let cursor = self
            .db
            .get_cursor(viewer_id, circle_id, remote_domain)
            .await?;
        Ok(cursor
            .filter(|c| c.state_hash == state_hash)
            .map(|c| c.since))
    }

    /// Advance the cursor after a successful pull.
    pub async fn advance_cursor(
        &self,
        viewer_id: &str,
        circle_id: &str,
        remote_domain: &str,
        since: &str,
        state_hash: &str,
    ) -> Result<(), AppError> {
        self.db
            .upsert_cursor(viewer_id, circle_id, remote_domain, since, state_hash)
            .await
    }

    /// Execute an outbound incremental pull against a peer.
    ///
    /// On success the cursor advances to the last activity id returned;
    /// on any failure the cursor is left untouched.
    pub async fn pull_from_peer(
        &self,
        protocol: &str,
        remote_domain: &str,
        viewer_id: &str,
        circle_id: &str,
        remote_actors: &[String],
        filters: &[String],
    ) -> Result<Vec<serde_json::Value>, AppError> {
        let peer_base = format!("{}://{}", protocol, remote_domain);
        let token = self.sign_pull_token(&peer_base)?;

        let hash = state_hash(remote_actors, filters);
        let since = self
            .cursor_since(viewer_id, circle_id, remote_domain, &hash)
            .await?
            .unwrap_or_default();

        let url = format!("{}/federation/pull", peer_base);
        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("since", since.as_str())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Pull from {} failed: {}", remote_domain, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Peer {} rejected pull: HTTP {}",
                remote_domain,
                response.status()
            )));
        }

        let activities: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Invalid pull response: {}", e)))?;

        if let Some(last_id) = activities
            .iter()
            .filter_map(|a| a.get("id").and_then(|v| v.as_str()))
            .next_back()
        {
            self.advance_cursor(viewer_id, circle_id, remote_domain, last_id, &hash)
                .await?;
        }

        tracing::info!(
            %remote_domain,
            viewer = %viewer_id,
            pulled = activities.len(),
            "Incremental pull completed"
        );

        Ok(activities)
    }

    /// Purge expired nonces; called by the background sweep.
    pub async fn sweep_expired_nonces(&self) -> Result<u64, AppError> {
        self.db.sweep_expired_nonces(Utc::now()).await
    }
}

/// Cache key over the normalized actor set and filter set.
///
/// Changing which actors are followed, or which filters apply,
/// invalidates cursors without deleting history.
pub fn state_hash(actors: &[String], filters: &[String]) -> String {
    let mut actors: Vec<String> = actors.to_vec();
    actors.sort();
    actors.dedup();
    let mut filters: Vec<String> = filters.to_vec();
    filters.sort();
    filters.dedup();

    let mut hasher = Sha256::new();
    for actor in &actors {
        hasher.update(actor.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--\n");
    for filter in &filters {
        hasher.update(filter.as_bytes());
        hasher.update(b"\n");
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Extract and validate the issuer domain from its base URL.
fn issuer_domain(issuer: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(issuer)
        .map_err(|e| AppError::Forbidden(format!("Invalid issuer URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Forbidden(format!(
                "Unsupported issuer URL scheme: {}",
                scheme
            )));
        }
    }

    parsed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| AppError::Forbidden("Missing host in issuer URL".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_hash_is_order_insensitive_and_dedup_stable() {
        let a = state_hash(
            &["bob@x.org".to_string(), "alice@x.org".to_string()],
            &["notes".to_string()],
        );
        let b = state_hash(
            &[
                "alice@x.org".to_string(),
                "bob@x.org".to_string(),
                "bob@x.org".to_string(),
            ],
            &["notes".to_string()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn state_hash_changes_with_actor_or_filter_set() {
        let base = state_hash(&["alice@x.org".to_string()], &[]);
        assert_ne!(
            base,
            state_hash(
                &["alice@x.org".to_string(), "bob@x.org".to_string()],
                &[]
            )
        );
        assert_ne!(
            base,
            state_hash(&["alice@x.org".to_string()], &["notes".to_string()])
        );
    }

    #[test]
    fn state_hash_separates_actor_and_filter_sections() {
        // An entry must not slide between sections.
        let as_actor = state_hash(&["x".to_string()], &[]);
        let as_filter = state_hash(&[], &["x".to_string()]);
        assert_ne!(as_actor, as_filter);
    }

    #[test]
    fn issuer_domain_rejects_non_http_schemes() {
        assert!(issuer_domain("ftp://peer.example").is_err());
        assert!(issuer_domain("not a url").is_err());
        assert_eq!(
            issuer_domain("https://Peer.Example").unwrap(),
            "peer.example"
        );
    }

    mod verification {
        use super::super::*;
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use tempfile::TempDir;

        const ISSUER: &str = "https://peer.example";
        const AUDIENCE: &str = "https://local.example";

        struct Harness {
            protocol: PullProtocol,
            private_key_pem: String,
            _temp_dir: TempDir,
        }

        /// A protocol instance whose key cache already trusts the
        /// issuer, so verification needs no network.
        async fn harness() -> Harness {
            let temp_dir = TempDir::new().unwrap();
            let db = Arc::new(
                Database::connect(&temp_dir.path().join("test.db"))
                    .await
                    .unwrap(),
            );

            let mut rng = rand::thread_rng();
            let private_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
            let public_key = rsa::RsaPublicKey::from(&private_key);
            let private_key_pem = private_key
                .to_pkcs8_pem(LineEnding::LF)
                .unwrap()
                .to_string();
            let public_key_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();

            let http_client = Arc::new(reqwest::Client::new());
            let key_cache = Arc::new(IssuerKeyCache::new(http_client.clone(), None));
            key_cache.seed(ISSUER, public_key_pem).await;

            let protocol = PullProtocol::new(
                db,
                key_cache,
                http_client,
                ISSUER.to_string(),
                format!("{}/actor", ISSUER),
                private_key_pem.clone(),
                60,
                300,
                500,
            );

            Harness {
                protocol,
                private_key_pem,
                _temp_dir: temp_dir,
            }
        }

        /// Sign arbitrary claims the way `sign_pull_token` does.
        fn sign_claims(private_key_pem: &str, claims: &PullClaims) -> String {
            let payload = serde_json::to_string(claims).unwrap();
            let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());

            let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).unwrap();
            let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
            let mut rng = rand::thread_rng();
            let signature = signing_key.sign_with_rng(&mut rng, payload_b64.as_bytes());

            format!(
                "{}.{}",
                payload_b64,
                URL_SAFE_NO_PAD.encode(signature.to_bytes())
            )
        }

        fn claims(scope: &str, iat: i64, exp: i64) -> PullClaims {
            PullClaims {
                iss: ISSUER.to_string(),
                aud: AUDIENCE.to_string(),
                scope: scope.to_string(),
                sub: format!("{}/actor", ISSUER),
                iat,
                exp,
            }
        }

        #[tokio::test]
        async fn signed_token_verifies_and_yields_the_issuer_domain() {
            let harness = harness().await;
            let token = harness.protocol.sign_pull_token(AUDIENCE).unwrap();

            let verified = harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap();
            assert_eq!(verified.domain, "peer.example");
            assert_eq!(verified.claims.scope, PULL_SCOPE);
            assert_eq!(verified.claims.aud, AUDIENCE);
        }

        #[tokio::test]
        async fn audience_mismatch_is_an_authorization_error() {
            let harness = harness().await;
            let token = harness.protocol.sign_pull_token(AUDIENCE).unwrap();

            let error = harness
                .protocol
                .verify_pull_token(&token, "https://somewhere-else.example")
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Forbidden(_)));
        }

        #[tokio::test]
        async fn wrong_scope_is_rejected() {
            let harness = harness().await;
            let now = Utc::now().timestamp();
            let token = sign_claims(
                &harness.private_key_pem,
                &claims("federation:push", now, now + 60),
            );

            let error = harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Forbidden(_)));
        }

        #[tokio::test]
        async fn expired_token_cannot_resume_a_stale_pull() {
            let harness = harness().await;
            let now = Utc::now().timestamp();
            let token = sign_claims(
                &harness.private_key_pem,
                &claims(PULL_SCOPE, now - 120, now - 60),
            );

            let error = harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Replay(_)));
        }

        #[tokio::test]
        async fn lifetime_beyond_sixty_seconds_is_rejected() {
            let harness = harness().await;
            let now = Utc::now().timestamp();
            let token = sign_claims(
                &harness.private_key_pem,
                &claims(PULL_SCOPE, now, now + 3600),
            );

            let error = harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Forbidden(_)));
        }

        #[tokio::test]
        async fn tampered_payload_fails_signature_verification() {
            let harness = harness().await;
            let token = harness.protocol.sign_pull_token(AUDIENCE).unwrap();

            let (_, signature) = token.split_once('.').unwrap();
            let now = Utc::now().timestamp();
            let forged_claims = claims(PULL_SCOPE, now, now + 60);
            let forged_payload =
                URL_SAFE_NO_PAD.encode(serde_json::to_string(&forged_claims).unwrap());
            let forged = format!("{}.{}", forged_payload, signature);

            let error = harness
                .protocol
                .verify_pull_token(&forged, AUDIENCE)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::InvalidSignature));
        }

        #[tokio::test]
        async fn replayed_signature_is_rejected_before_nonce_expiry() {
            let harness = harness().await;
            let token = harness.protocol.sign_pull_token(AUDIENCE).unwrap();

            harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap();

            let error = harness
                .protocol
                .verify_pull_token(&token, AUDIENCE)
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Replay(_)));
        }
    }
}
