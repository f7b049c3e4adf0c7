//! Activity dispatcher
//!
//! Drives each activity through the state machine
//! `received → normalized → validated → visibility-checked → handled →
//! (federated?) → done`, with an absorbing error state reachable from
//! any step. The dispatcher never lets an error escape as a panic or
//! exception: callers always receive a tagged [`DispatchReport`], so one
//! bad activity cannot take down a batch processed in the same sweep.

use std::sync::Arc;

use serde::Serialize;

use crate::activity::handlers::{HandlerOutcome, Handlers, SideEffect};
use crate::activity::hooks::HookSet;
use crate::activity::normalize::normalize;
use crate::activity::registry::{ActivityRegistry, FederationRule};
use crate::data::{
    Activity, ActivityRecord, AudienceToken, Database, domain_of_actor_id,
};
use crate::error::AppError;
use crate::federation::DeliveryQueue;
use crate::metrics::{ACTIVITIES_DISPATCHED_TOTAL, HOOK_FAILURES_TOTAL};

/// Where a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStage {
    Received,
    Normalized,
    Validated,
    VisibilityChecked,
    Handled,
    Federated,
    Done,
    Error,
}

impl DispatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Validated => "validated",
            Self::VisibilityChecked => "visibility-checked",
            Self::Handled => "handled",
            Self::Federated => "federated",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// Tagged dispatch result.
///
/// `error` is set instead of the success fields when any step failed;
/// the report never carries both.
#[derive(Debug, Serialize)]
pub struct DispatchReport {
    /// The dispatched envelope in wire form
    pub activity: Option<serde_json::Value>,
    pub created_objects: Vec<String>,
    pub side_effects: Vec<SideEffect>,
    pub federate: bool,
    pub stage: DispatchStage,
    pub error: Option<String>,
}

impl DispatchReport {
    fn rejected(stage: DispatchStage, error: &AppError) -> Self {
        Self {
            activity: None,
            created_objects: Vec::new(),
            side_effects: Vec::new(),
            federate: false,
            stage,
            error: Some(error.to_string()),
        }
    }
}

/// Routes validated activities to their handlers.
pub struct Dispatcher {
    db: Arc<Database>,
    registry: Arc<ActivityRegistry>,
    handlers: Handlers,
    hooks: Arc<HookSet>,
    delivery: Arc<DeliveryQueue>,
    local_domain: String,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ActivityRegistry>,
        handlers: Handlers,
        hooks: Arc<HookSet>,
        delivery: Arc<DeliveryQueue>,
        local_domain: String,
    ) -> Self {
        Self {
            db,
            registry,
            handlers,
            hooks,
            delivery,
            local_domain,
        }
    }

    /// Dispatch one raw activity.
    ///
    /// Consumes the envelope exactly once; the stored record is never
    /// mutated afterwards except for the federation decision.
    pub async fn dispatch(&self, raw: &serde_json::Value) -> DispatchReport {
        let mut stage = DispatchStage::Received;
        match self.run(raw, &mut stage).await {
            Ok(report) => {
                ACTIVITIES_DISPATCHED_TOTAL
                    .with_label_values(&[
                        report
                            .activity
                            .as_ref()
                            .and_then(|a| a.get("type"))
                            .and_then(|t| t.as_str())
                            .unwrap_or("unknown"),
                        "done",
                    ])
                    .inc();
                report
            }
            Err(error) => {
                tracing::warn!(
                    stage = stage.as_str(),
                    error = %error,
                    "Activity dispatch failed"
                );
                ACTIVITIES_DISPATCHED_TOTAL
                    .with_label_values(&["unknown", "error"])
                    .inc();
                DispatchReport::rejected(DispatchStage::Error, &error)
            }
        }
    }

    async fn run(
        &self,
        raw: &serde_json::Value,
        stage: &mut DispatchStage,
    ) -> Result<DispatchReport, AppError> {
        // received → normalized
        let mut activity = normalize(raw)?;
        *stage = DispatchStage::Normalized;

        let schema = self.registry.schema(&activity.activity_type)?;

        // Best-effort before hook; failures are observable, never fatal.
        if let Err(error) = self.hooks.run_before(&activity).await {
            HOOK_FAILURES_TOTAL
                .with_label_values(&[&activity.activity_type, "before"])
                .inc();
            tracing::warn!(
                activity_type = %activity.activity_type,
                actor = %activity.actor_id,
                %error,
                "Swallowed before-hook failure"
            );
        }

        // normalized → validated
        schema.check_required(&activity)?;
        if let Some(validate) = schema.validate {
            validate(&activity)?;
        }
        *stage = DispatchStage::Validated;

        // validated → visibility-checked: the actor must be allowed to
        // address every audience token it names.
        self.check_audience_authority(&activity).await?;
        *stage = DispatchStage::VisibilityChecked;

        // visibility-checked → handled
        let outcome = if activity.activity_type == "Undo" {
            self.handle_undo(&activity).await?
        } else {
            self.handlers.handle(&activity).await?
        };
        *stage = DispatchStage::Handled;

        // A Create's payload has no id until the handler stores it; the
        // log row and any delivery job reference the stored object.
        let object_ref = activity
            .object_ref()
            .or_else(|| outcome.created_objects.first().map(|o| o.id.clone()));

        // handled → federated?
        let mut side_effects = outcome.side_effects.clone();
        let recipient_domains = self.resolve_federation_domains(schema.federation, &activity).await?;
        if !recipient_domains.is_empty() {
            activity.federate = true;

            let delivery_object_id = object_ref
                .clone()
                .unwrap_or_else(|| activity.id.clone());
            let local_addressees = self.resolve_local_addressees(&activity).await?;

            match self
                .delivery
                .enqueue(
                    &delivery_object_id,
                    &recipient_domains,
                    &activity,
                    local_addressees,
                )
                .await?
            {
                Some(job_id) => side_effects.push(SideEffect::DeliveryQueued { job_id }),
                None => side_effects.push(SideEffect::DeliveryAlreadyQueued),
            }
            *stage = DispatchStage::Federated;
        }

        // Persist the dispatched envelope with its federation decision.
        let mut record = activity_record(&activity);
        if let Some(reference) = object_ref {
            record.object_ref = reference;
        }
        self.db.insert_activity(&record).await?;

        // Best-effort after hook.
        if let Err(error) = self.hooks.run_after(&activity, &outcome).await {
            HOOK_FAILURES_TOTAL
                .with_label_values(&[&activity.activity_type, "after"])
                .inc();
            tracing::warn!(
                activity_type = %activity.activity_type,
                actor = %activity.actor_id,
                %error,
                "Swallowed after-hook failure"
            );
        }

        *stage = DispatchStage::Done;
        Ok(DispatchReport {
            activity: Some(activity_to_json(&activity)),
            created_objects: outcome
                .created_objects
                .iter()
                .map(|o| o.id.clone())
                .collect(),
            side_effects,
            federate: activity.federate,
            stage: DispatchStage::Done,
            error: None,
        })
    }

    /// Undo resolves the reversal generically through the registry's
    /// mirror metadata instead of hardcoding per-type branches.
    async fn handle_undo(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let undone_id = activity
            .object_ref()
            .ok_or_else(|| AppError::Validation("Undo requires an activity reference".to_string()))?;

        let record = self
            .db
            .get_activity(&undone_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("activity {}", undone_id)))?;

        if record.actor_id != activity.actor_id {
            return Err(AppError::Forbidden(format!(
                "{} cannot undo an activity by {}",
                activity.actor_id, record.actor_id
            )));
        }

        let mirror_type = self
            .registry
            .mirror_of(&record.activity_type)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Activity type {} is not undoable",
                    record.activity_type
                ))
            })?;

        let mirrored = Activity {
            id: activity.id.clone(),
            activity_type: mirror_type.to_string(),
            actor_id: record.actor_id.clone(),
            object: serde_json::Value::String(record.object_ref.clone()),
            object_type: record.object_type.clone(),
            target: record.target.clone(),
            to: AudienceToken::parse(&record.to_token),
            can_reply: AudienceToken::parse(&record.can_reply),
            can_react: AudienceToken::parse(&record.can_react),
            summary: None,
            federate: false,
            created_at: activity.created_at,
        };

        let mirror_schema = self.registry.schema(mirror_type)?;
        mirror_schema.check_required(&mirrored)?;
        if let Some(validate) = mirror_schema.validate {
            validate(&mirrored)?;
        }

        tracing::info!(
            undone = %undone_id,
            original_type = %record.activity_type,
            mirror = mirror_type,
            "Undo resolved through mirror"
        );

        self.handlers.handle(&mirrored).await
    }

    /// An actor may only address circles it owns or belongs to.
    async fn check_audience_authority(&self, activity: &Activity) -> Result<(), AppError> {
        for token in [&activity.to, &activity.can_reply, &activity.can_react] {
            let Some(circle_id) = token.circle_id() else {
                continue;
            };

            let circle = self
                .db
                .get_circle(circle_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("circle {}", circle_id)))?;

            if circle.owner_id != activity.actor_id
                && !self.db.is_member(circle_id, &activity.actor_id).await?
            {
                return Err(AppError::Forbidden(format!(
                    "{} may not address circle {}",
                    activity.actor_id, circle_id
                )));
            }
        }
        Ok(())
    }

    /// Remote domains owed this activity per the schema's federation rule.
    async fn resolve_federation_domains(
        &self,
        rule: FederationRule,
        activity: &Activity,
    ) -> Result<Vec<String>, AppError> {
        let field = match rule {
            FederationRule::Never => return Ok(Vec::new()),
            FederationRule::Field(field) => field,
        };

        let domain = match field {
            "to" => match &activity.to {
                AudienceToken::Domain(domain) => Some(domain.clone()),
                AudienceToken::Actor(id) => domain_of_actor_id(id),
                // Public and circle audiences reach remote peers through
                // the pull protocol, not push delivery.
                _ => None,
            },
            "object" => match activity.object_ref() {
                Some(reference) => self.domain_of_reference(&reference).await?,
                None => None,
            },
            "target" => match activity.target.as_deref() {
                Some(reference) => self.domain_of_reference(reference).await?,
                None => None,
            },
            other => {
                return Err(AppError::Validation(format!(
                    "Schema federation rule names unknown field: {}",
                    other
                )));
            }
        };

        Ok(domain
            .filter(|d| *d != self.local_domain)
            .into_iter()
            .collect())
    }

    /// Domain behind a reference: an actor id directly, or the author of
    /// a stored object.
    async fn domain_of_reference(&self, reference: &str) -> Result<Option<String>, AppError> {
        if let Some(object) = self.db.get_object(reference).await? {
            return Ok(object.actor_domain());
        }
        Ok(domain_of_actor_id(reference))
    }

    /// Local addressee ids, captured on the job for audit only.
    async fn resolve_local_addressees(
        &self,
        activity: &Activity,
    ) -> Result<Vec<String>, AppError> {
        match &activity.to {
            AudienceToken::Actor(id) => {
                let is_local = domain_of_actor_id(id)
                    .is_some_and(|domain| domain == self.local_domain);
                Ok(if is_local { vec![id.clone()] } else { Vec::new() })
            }
            AudienceToken::Circle(circle_id) | AudienceToken::Group(circle_id) => {
                let members = self.db.members_of(circle_id).await?;
                Ok(members
                    .into_iter()
                    .filter(|m| m.server.as_deref() == Some(self.local_domain.as_str()))
                    .map(|m| m.member_id)
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn activity_record(activity: &Activity) -> ActivityRecord {
    ActivityRecord {
        id: activity.id.clone(),
        activity_type: activity.activity_type.clone(),
        actor_id: activity.actor_id.clone(),
        object_ref: activity.object_ref().unwrap_or_default(),
        object_type: activity.object_type.clone(),
        target: activity.target.clone(),
        to_token: activity.to.as_wire(),
        can_reply: activity.can_reply.as_wire(),
        can_react: activity.can_react.as_wire(),
        summary: activity.summary.clone(),
        federate: activity.federate,
        created_at: activity.created_at,
    }
}

/// Wire-form echo of a dispatched envelope.
pub fn activity_to_json(activity: &Activity) -> serde_json::Value {
    serde_json::json!({
        "id": activity.id,
        "type": activity.activity_type,
        "actorId": activity.actor_id,
        "object": activity.object,
        "objectType": activity.object_type,
        "target": activity.target,
        "to": activity.to.as_wire(),
        "canReply": activity.can_reply.as_wire(),
        "canReact": activity.can_react.as_wire(),
        "summary": activity.summary,
        "federate": activity.federate,
        "createdAt": activity.created_at.to_rfc3339(),
    })
}
