//! Timeline fan-out engine
//!
//! Materializes per-viewer timeline entries for newly visible objects.
//! Fan-out runs asynchronously behind a queued job so a transient
//! audience-resolution failure delays visibility instead of failing the
//! triggering write. Re-running on the same object is idempotent: the
//! unique (viewer_id, object_id) constraint backs the upserts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::data::{
    AudienceToken, Database, EntityId, FanoutJob, StoredObject, TimelineEntry, TimelineReason,
};
use crate::error::AppError;
use crate::federation::backoff_delay;
use crate::metrics::TIMELINE_ENTRIES_UPSERTED_TOTAL;
use crate::visibility::build_visibility_filter;

/// Fan-out engine and its queue worker.
pub struct FanOutEngine {
    db: Arc<Database>,
    local_domain: String,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl FanOutEngine {
    pub fn new(
        db: Arc<Database>,
        local_domain: String,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            db,
            local_domain,
            backoff_base,
            backoff_cap,
        }
    }

    /// One worker sweep over due fan-out jobs.
    ///
    /// Per-job errors are caught so one failing object cannot halt the
    /// polling loop; failed jobs retry with the shared backoff policy.
    pub async fn poll_and_process(&self) -> Result<(), AppError> {
        let jobs = self.db.claim_due_fanout_jobs(Utc::now(), 20).await?;

        for job in jobs {
            let job_id = job.id.clone();
            if let Err(error) = self.process_job(job).await {
                tracing::error!(job_id = %job_id, %error, "Fan-out job processing failed");
            }
        }

        Ok(())
    }

    async fn process_job(&self, job: FanoutJob) -> Result<(), AppError> {
        match self.run_fanout(&job.object_id).await {
            Ok(upserted) => {
                tracing::info!(
                    object_id = %job.object_id,
                    upserted,
                    "Fan-out completed"
                );
                self.db.complete_fanout_job(&job.id).await
            }
            Err(error) => {
                let attempts = job.attempts + 1;
                if attempts >= job.max_attempts {
                    tracing::error!(
                        object_id = %job.object_id,
                        attempts,
                        %error,
                        "Fan-out job exhausted"
                    );
                    return self
                        .db
                        .fail_fanout_job(&job.id, attempts, &error.to_string())
                        .await;
                }

                let delay = backoff_delay(attempts, self.backoff_base, self.backoff_cap);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                self.db
                    .reschedule_fanout_job(&job.id, attempts, next_attempt_at, &error.to_string())
                    .await
            }
        }
    }

    /// Fan one object out to every eligible local viewer.
    ///
    /// A viewer is eligible when the visibility resolver would show them
    /// the object; each gets exactly one entry tagged with the highest-
    /// priority applicable reason.
    pub async fn run_fanout(&self, object_id: &str) -> Result<u64, AppError> {
        let Some(object) = self.db.get_object(object_id).await? else {
            // Object vanished between enqueue and fan-out; retract any
            // entries an earlier run materialized.
            return Ok(self.db.soft_delete_timeline_entries(object_id).await?);
        };

        if object.deleted_at.is_some() {
            return Ok(self.db.soft_delete_timeline_entries(object_id).await?);
        }

        let viewers = self.db.get_local_actors().await?;
        let mut upserted = 0u64;

        for viewer in viewers {
            let context = self
                .db
                .viewer_context(&viewer.id, &self.local_domain)
                .await?;
            let filter = build_visibility_filter(&context);
            if !filter.matches(&object) {
                continue;
            }

            let following = self.db.following_member_ids(&viewer.id).await?;
            let author_domain_token = object
                .actor_domain()
                .map(|domain| format!("@{}", domain));

            let follows_author = following.contains(&object.actor_id)
                || author_domain_token
                    .as_ref()
                    .is_some_and(|token| following.contains(token));

            let (reason, local_circle_id) =
                resolve_reason(&viewer.id, &object, &context.circle_ids, follows_author);

            let entry = TimelineEntry {
                id: EntityId::new().0,
                viewer_id: viewer.id.clone(),
                object_id: object.id.clone(),
                object_type: object.object_type.clone(),
                // Sort key is the source object's timestamp; fan-out may
                // run out of order relative to object creation.
                created_at: object.created_at,
                reason: reason.as_str().to_string(),
                scope: object.to().scope().as_str().to_string(),
                local_circle_id,
                snapshot: snapshot_of(&object),
                deleted_at: None,
            };

            self.db.upsert_timeline_entry(&entry).await?;
            TIMELINE_ENTRIES_UPSERTED_TOTAL
                .with_label_values(&[reason.as_str()])
                .inc();
            upserted += 1;
        }

        Ok(upserted)
    }

    /// Hard-delete soft-deleted entries past the retention window.
    pub async fn sweep_retention(&self, retention_seconds: i64) -> Result<u64, AppError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(retention_seconds);
        let removed = self.db.sweep_timeline_retention(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "Timeline retention sweep");
        }
        Ok(removed)
    }
}

/// Pick the single reason for a viewer's entry.
///
/// Priority order when several apply: self > circle > follow > mention >
/// domain. First match wins so a viewer never gets duplicate entries for
/// overlapping reasons.
fn resolve_reason(
    viewer_id: &str,
    object: &StoredObject,
    viewer_circles: &std::collections::HashSet<String>,
    follows_author: bool,
) -> (TimelineReason, Option<String>) {
    if viewer_id == object.actor_id {
        return (TimelineReason::Own, None);
    }

    if let Some(circle_id) = object.to().circle_id() {
        if viewer_circles.contains(circle_id) {
            return (TimelineReason::Circle, Some(circle_id.to_string()));
        }
    }

    if follows_author {
        return (TimelineReason::Follow, None);
    }

    let mentioned = object.mentions().iter().any(|m| m == viewer_id)
        || matches!(object.to(), AudienceToken::Actor(ref id) if id == viewer_id);
    if mentioned {
        return (TimelineReason::Mention, None);
    }

    (TimelineReason::Domain, None)
}

/// Small rendering-only snapshot stored on the entry.
fn snapshot_of(object: &StoredObject) -> String {
    let excerpt = serde_json::from_str::<serde_json::Value>(&object.payload)
        .ok()
        .and_then(|payload| {
            payload
                .get("text")
                .or_else(|| payload.get("name"))
                .and_then(|v| v.as_str())
                .map(|text| text.chars().take(140).collect::<String>())
        });

    serde_json::json!({
        "actorId": object.actor_id,
        "objectType": object.object_type,
        "summary": object.summary,
        "excerpt": excerpt,
    })
    .to_string()
}
