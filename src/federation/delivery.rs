//! Federation delivery queue and worker
//!
//! Outbound activities land here as durable jobs. Workers claim jobs
//! with an atomic status CAS, deliver per recipient domain with a
//! bounded timeout, and either complete, reschedule the failed subset
//! with capped exponential backoff, or mark the job failed once
//! attempts are exhausted. A dedupe hash keyed on (object id, recipient
//! domain set) makes double-enqueueing a no-op.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::data::{Activity, AudienceSnapshot, Database, DeliveryJob, EntityId, JobStatus};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_JOBS_PENDING, DELIVERY_RETRIES_TOTAL};

/// Tuning knobs for the queue and its worker.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub max_attempts: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub request_timeout: Duration,
    pub job_ttl_seconds: i64,
    pub local_domain: String,
    pub protocol: String,
}

/// Result of one per-domain delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub domain: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Durable outbound delivery queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    settings: DeliverySettings,
}

/// Content-derived key preventing duplicate queued work for the same
/// logical delivery.
pub fn dedupe_hash(object_id: &str, domains: &[String]) -> String {
    let mut normalized: Vec<String> =
        domains.iter().map(|d| d.to_ascii_lowercase()).collect();
    normalized.sort();
    normalized.dedup();

    let mut hasher = Sha256::new();
    hasher.update(object_id.as_bytes());
    for domain in &normalized {
        hasher.update(b"\n");
        hasher.update(domain.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Exponential backoff without jitter: monotonically increasing per
/// attempt and capped.
pub fn backoff_delay(attempt: i64, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}

impl DeliveryQueue {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            db,
            http_client,
            settings,
        }
    }

    /// Enqueue a delivery job for an object and its recipient domains.
    ///
    /// # Returns
    /// The new job id, or `None` when an identical logical delivery is
    /// already queued (unique dedupe hash).
    pub async fn enqueue(
        &self,
        object_id: &str,
        domains: &[String],
        activity: &Activity,
        local_addressees: Vec<String>,
    ) -> Result<Option<String>, AppError> {
        let mut normalized: Vec<String> =
            domains.iter().map(|d| d.to_ascii_lowercase()).collect();
        normalized.sort();
        normalized.dedup();
        normalized.retain(|d| *d != self.settings.local_domain);

        if normalized.is_empty() {
            return Ok(None);
        }

        let audience = AudienceSnapshot {
            to: activity.to.as_wire(),
            can_reply: activity.can_reply.as_wire(),
            can_react: activity.can_react.as_wire(),
            local_addressees,
        };

        let now = Utc::now();
        let job = DeliveryJob {
            id: EntityId::new().0,
            object_id: object_id.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            audience: serde_json::to_string(&audience)
                .map_err(|e| AppError::Internal(e.into()))?,
            domains: serde_json::to_string(&normalized)
                .map_err(|e| AppError::Internal(e.into()))?,
            counts: "{}".to_string(),
            attempts: 0,
            max_attempts: self.settings.max_attempts,
            next_attempt_at: now,
            last_error: None,
            dedupe_hash: dedupe_hash(object_id, &normalized),
            expires_at: now + chrono::Duration::seconds(self.settings.job_ttl_seconds),
            created_at: now,
            completed_at: None,
        };

        let enqueued = self.db.enqueue_delivery_job(&job).await?;
        match &enqueued {
            Some(job_id) => {
                tracing::info!(
                    job_id = %job_id,
                    object_id = %object_id,
                    domains = normalized.len(),
                    "Delivery job enqueued"
                );
            }
            None => {
                tracing::debug!(
                    object_id = %object_id,
                    "Delivery already queued, enqueue is a no-op"
                );
            }
        }
        Ok(enqueued)
    }

    /// One worker sweep: claim due jobs and process each.
    ///
    /// Per-job errors are caught here so one job cannot halt the loop.
    pub async fn poll_and_process(&self) -> Result<(), AppError> {
        let jobs = self.db.claim_due_delivery_jobs(Utc::now(), 20).await?;

        for job in jobs {
            let job_id = job.id.clone();
            if let Err(error) = self.process_job(job).await {
                tracing::error!(job_id = %job_id, %error, "Delivery job processing failed");
            }
        }

        if let Ok(pending) = self.db.count_delivery_jobs(JobStatus::Pending).await {
            DELIVERY_JOBS_PENDING.set(pending);
        }

        Ok(())
    }

    /// Process one claimed job: deliver to every pending domain, then
    /// record completion, a retry for the failed subset, or exhaustion.
    async fn process_job(&self, job: DeliveryJob) -> Result<(), AppError> {
        let domains = job.pending_domains();
        let body = self.delivery_body(&job.object_id).await?;

        let mut results = Vec::with_capacity(domains.len());
        for domain in &domains {
            let result = match self.deliver_to_domain(domain, &body).await {
                Ok(()) => DeliveryResult {
                    domain: domain.clone(),
                    success: true,
                    error: None,
                },
                Err(error) => DeliveryResult {
                    domain: domain.clone(),
                    success: false,
                    error: Some(error.to_string()),
                },
            };
            DELIVERIES_TOTAL
                .with_label_values(&[if result.success { "success" } else { "failure" }])
                .inc();
            results.push(result);
        }

        let delivered = results.iter().filter(|r| r.success).count() as i64;
        let failed: Vec<&DeliveryResult> = results.iter().filter(|r| !r.success).collect();

        let mut counts = job.counts_by_reason();
        *counts.entry("delivered".to_string()).or_insert(0) += delivered;
        let counts_json =
            serde_json::to_string(&counts).map_err(|e| AppError::Internal(e.into()))?;

        if failed.is_empty() {
            self.db.complete_delivery_job(&job.id, &counts_json).await?;
            tracing::info!(
                job_id = %job.id,
                delivered,
                "Delivery job completed"
            );
            return Ok(());
        }

        let attempts = job.attempts + 1;
        let last_error = summarize_failures(&failed);

        if attempts >= job.max_attempts {
            // Terminal: surfaced for operator visibility, never retried.
            self.db
                .fail_delivery_job(&job.id, attempts, &last_error)
                .await?;
            let exhausted = AppError::ExhaustedRetry {
                attempts,
                last_error,
            };
            tracing::error!(
                job_id = %job.id,
                error = %exhausted,
                "Delivery job exhausted"
            );
            return Ok(());
        }

        let remaining: Vec<String> = failed.iter().map(|r| r.domain.clone()).collect();
        let remaining_json =
            serde_json::to_string(&remaining).map_err(|e| AppError::Internal(e.into()))?;
        let delay = self.backoff_with_jitter(attempts);
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

        self.db
            .reschedule_delivery_job(
                &job.id,
                attempts,
                next_attempt_at,
                &remaining_json,
                &counts_json,
                &last_error,
            )
            .await?;
        DELIVERY_RETRIES_TOTAL.inc();

        tracing::warn!(
            job_id = %job.id,
            attempts,
            remaining = remaining.len(),
            retry_in_secs = delay.as_secs(),
            "Delivery job rescheduled for failed subset"
        );

        Ok(())
    }

    /// POST the body to one peer's shared inbox.
    ///
    /// The request carries a timeout so a hung peer cannot block the
    /// polling loop; a timeout is a retryable delivery failure.
    async fn deliver_to_domain(
        &self,
        domain: &str,
        body: &serde_json::Value,
    ) -> Result<(), AppError> {
        let inbox_url = format!("{}://{}/federation/inbox", self.settings.protocol, domain);

        let response = self
            .http_client
            .post(&inbox_url)
            .header("Content-Type", "application/json")
            .timeout(self.settings.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to deliver to {}: {}", domain, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Peer {} rejected delivery: HTTP {}",
                domain,
                response.status()
            )));
        }

        tracing::debug!(%domain, "Delivered to peer inbox");
        Ok(())
    }

    /// Body for a delivery: the stored object, the activity record, or a
    /// bare reference when neither survives.
    async fn delivery_body(&self, object_id: &str) -> Result<serde_json::Value, AppError> {
        if let Some(object) = self.db.get_object(object_id).await? {
            let payload: serde_json::Value =
                serde_json::from_str(&object.payload).unwrap_or(serde_json::Value::Null);
            return Ok(serde_json::json!({
                "id": object.id,
                "type": object.object_type,
                "actorId": object.actor_id,
                "payload": payload,
                "summary": object.summary,
                "to": object.to_token,
                "createdAt": object.created_at.to_rfc3339(),
            }));
        }

        if let Some(record) = self.db.get_activity(object_id).await? {
            return Ok(serde_json::json!({
                "id": record.id,
                "type": record.activity_type,
                "actorId": record.actor_id,
                "object": record.object_ref,
                "target": record.target,
                "to": record.to_token,
                "createdAt": record.created_at.to_rfc3339(),
            }));
        }

        Ok(serde_json::json!({ "id": object_id }))
    }

    fn backoff_with_jitter(&self, attempt: i64) -> Duration {
        let base = backoff_delay(
            attempt,
            self.settings.backoff_base,
            self.settings.backoff_cap,
        );
        let jitter_ms = rand::thread_rng().gen_range(0..1000);
        base + Duration::from_millis(jitter_ms)
    }

    /// TTL purge of completed/failed/stale jobs, independent of status.
    pub async fn sweep_expired(&self) -> Result<u64, AppError> {
        let removed = self.db.sweep_expired_delivery_jobs(Utc::now()).await?;
        if removed > 0 {
            tracing::info!(removed, "Purged expired delivery jobs");
        }
        Ok(removed)
    }
}

fn summarize_failures(failed: &[&DeliveryResult]) -> String {
    let summaries: Vec<String> = failed
        .iter()
        .map(|r| {
            format!(
                "{}: {}",
                r.domain,
                r.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    summaries.join("; ")
}
