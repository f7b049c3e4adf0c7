//! Before/after dispatch hooks
//!
//! Hooks are best-effort auxiliary behavior: a failing hook is logged
//! and swallowed by the dispatcher, never rolled into the primary
//! handler's outcome. The structured logging is the observability
//! contract: silent data loss here would otherwise be invisible.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::activity::handlers::HandlerOutcome;
use crate::data::Activity;
use crate::error::AppError;

const DEFAULT_AUDIT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_AUDIT_LIMIT: u32 = 120;

/// Sliding-window counter per actor for the audit hook
#[derive(Debug, Clone)]
struct AuditEntry {
    count: u32,
    window_start: Instant,
}

impl AuditEntry {
    fn increment(&mut self, window: Duration) -> u32 {
        if self.window_start.elapsed() >= window {
            self.count = 1;
            self.window_start = Instant::now();
        } else {
            self.count += 1;
        }
        self.count
    }
}

/// Registered hook set, consulted per activity type.
pub struct HookSet {
    audit: RwLock<HashMap<String, AuditEntry>>,
    audit_window: Duration,
    audit_limit: u32,
}

impl HookSet {
    pub fn new() -> Self {
        Self::with_audit_limit(DEFAULT_AUDIT_LIMIT, DEFAULT_AUDIT_WINDOW)
    }

    pub fn with_audit_limit(audit_limit: u32, audit_window: Duration) -> Self {
        Self {
            audit: RwLock::new(HashMap::new()),
            audit_window,
            audit_limit,
        }
    }

    /// Types with a registered before hook.
    fn has_before(activity_type: &str) -> bool {
        matches!(activity_type, "Create" | "Follow" | "Block" | "React")
    }

    /// Types with a registered after hook.
    fn has_after(activity_type: &str) -> bool {
        matches!(activity_type, "Create" | "Follow" | "React")
    }

    /// Pre-validation hook: per-actor audit window.
    ///
    /// Returns an error when the actor exceeds the window limit; the
    /// dispatcher logs and continues (hooks never block the handler).
    pub async fn run_before(&self, activity: &Activity) -> Result<(), AppError> {
        if !Self::has_before(&activity.activity_type) {
            return Ok(());
        }

        let count = {
            let mut audit = self.audit.write().await;
            audit
                .entry(activity.actor_id.clone())
                .or_insert_with(|| AuditEntry {
                    count: 0,
                    window_start: Instant::now(),
                })
                .increment(self.audit_window)
        };

        tracing::debug!(
            actor = %activity.actor_id,
            activity_type = %activity.activity_type,
            window_count = count,
            "Dispatch audit"
        );

        if count > self.audit_limit {
            return Err(AppError::Validation(format!(
                "Actor {} exceeded {} activities per audit window",
                activity.actor_id, self.audit_limit
            )));
        }

        Ok(())
    }

    /// Post-handler hook: notification fan-out for interaction types.
    pub async fn run_after(
        &self,
        activity: &Activity,
        outcome: &HandlerOutcome,
    ) -> Result<(), AppError> {
        if !Self::has_after(&activity.activity_type) {
            return Ok(());
        }

        for object in &outcome.created_objects {
            for mentioned in object.mentions() {
                tracing::info!(
                    recipient = %mentioned,
                    object_id = %object.id,
                    activity_type = %activity.activity_type,
                    "Notification queued"
                );
            }
        }

        if activity.activity_type == "Follow" || activity.activity_type == "React" {
            if let Some(target) = activity.object_ref() {
                tracing::info!(
                    recipient = %target,
                    actor = %activity.actor_id,
                    activity_type = %activity.activity_type,
                    "Notification queued"
                );
            }
        }

        Ok(())
    }
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::AudienceToken;
    use chrono::Utc;

    fn activity(activity_type: &str) -> Activity {
        Activity {
            id: "01TEST".to_string(),
            activity_type: activity_type.to_string(),
            actor_id: "alice@local.example".to_string(),
            object: serde_json::json!({"type": "Note"}),
            object_type: Some("Note".to_string()),
            target: None,
            to: AudienceToken::Public,
            can_reply: AudienceToken::Public,
            can_react: AudienceToken::Public,
            summary: None,
            federate: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn before_hook_fails_past_the_audit_limit() {
        let hooks = HookSet::with_audit_limit(2, Duration::from_secs(60));
        let activity = activity("Create");

        assert!(hooks.run_before(&activity).await.is_ok());
        assert!(hooks.run_before(&activity).await.is_ok());
        assert!(hooks.run_before(&activity).await.is_err());
    }

    #[tokio::test]
    async fn types_without_hooks_are_untouched() {
        let hooks = HookSet::with_audit_limit(1, Duration::from_secs(60));
        let activity = activity("Unmute");

        // No hook registered: never counted, never fails.
        for _ in 0..5 {
            assert!(hooks.run_before(&activity).await.is_ok());
        }
    }
}
