//! Per-type activity handlers
//!
//! Business logic behind the dispatcher. Mutating handlers use
//! conditional, member-presence-guarded writes so re-delivery of the same
//! activity is a no-op, never a duplicate side effect.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::data::{
    Activity, CircleKind, Database, EntityId, Member, StoredObject, ViewerContext,
    domain_of_actor_id,
};
use crate::error::AppError;
use crate::visibility;

/// What a handler did, reported back through the dispatch result.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    MemberAdded {
        circle_id: String,
        member_id: String,
    },
    MemberAlreadyPresent {
        circle_id: String,
        member_id: String,
    },
    MemberRemoved {
        circle_id: String,
        member_id: String,
    },
    MemberAbsent {
        circle_id: String,
        member_id: String,
    },
    ObjectStored {
        object_id: String,
    },
    ObjectRetracted {
        object_id: String,
    },
    FanOutQueued {
        object_id: String,
        job_id: String,
    },
    CursorDropped {
        remote_domain: String,
    },
    DeliveryQueued {
        job_id: String,
    },
    DeliveryAlreadyQueued,
}

/// Handler return contract: created objects plus side effects.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub created_objects: Vec<StoredObject>,
    pub side_effects: Vec<SideEffect>,
}

impl HandlerOutcome {
    fn with_effect(effect: SideEffect) -> Self {
        Self {
            created_objects: Vec::new(),
            side_effects: vec![effect],
        }
    }
}

/// The per-type business logic, resolved by the dispatcher's match.
pub struct Handlers {
    db: Arc<Database>,
    local_domain: String,
    fanout_max_attempts: i64,
}

impl Handlers {
    pub fn new(db: Arc<Database>, local_domain: String, fanout_max_attempts: i64) -> Self {
        Self {
            db,
            local_domain,
            fanout_max_attempts,
        }
    }

    /// Route a validated activity to its handler.
    ///
    /// Resolution is by (type, object subtype | default): Create has a
    /// Comment-specific handler, everything else dispatches on type
    /// alone. The registry has already confirmed the type, so an
    /// unmatched arm here is a programming error surfaced as Validation,
    /// not a panic.
    pub async fn handle(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        match activity.activity_type.as_str() {
            "Create" => match activity.object_type.as_deref() {
                Some("Comment") => self.handle_create_comment(activity).await,
                _ => self.handle_create(activity).await,
            },
            "Follow" => self.handle_follow(activity).await,
            "Unfollow" => self.handle_unfollow(activity).await,
            "React" => self.handle_react(activity).await,
            "Unreact" => self.handle_unreact(activity).await,
            "Block" => self.handle_list_add(activity, CircleKind::Blocked).await,
            "Unblock" => self.handle_list_remove(activity, CircleKind::Blocked).await,
            "Mute" => self.handle_list_add(activity, CircleKind::Muted).await,
            "Unmute" => self.handle_list_remove(activity, CircleKind::Muted).await,
            "Add" => self.handle_roster_add(activity).await,
            "Remove" => self.handle_roster_remove(activity).await,
            other => Err(AppError::Validation(format!(
                "No handler for activity type: {}",
                other
            ))),
        }
    }

    /// Create: persist the embedded object and queue timeline fan-out.
    async fn handle_create(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let payload = &activity.object;

        let mentions: Vec<String> = payload
            .get("mentions")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let now = Utc::now();
        let object = StoredObject {
            id: EntityId::new().0,
            object_type: activity
                .object_type
                .clone()
                .unwrap_or_else(|| "Note".to_string()),
            actor_id: activity.actor_id.clone(),
            payload: payload.to_string(),
            summary: activity.summary.clone(),
            target: activity.target.clone(),
            to_token: activity.to.as_wire(),
            can_reply: activity.can_reply.as_wire(),
            can_react: activity.can_react.as_wire(),
            mentions: serde_json::to_string(&mentions)
                .map_err(|e| AppError::Internal(e.into()))?,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.db.upsert_object(&object).await?;

        // Fan-out is queued, not inline: a transient audience-resolution
        // failure delays visibility instead of failing the write.
        let job_id = self
            .db
            .enqueue_fanout_job(&object.id, self.fanout_max_attempts)
            .await?;

        tracing::info!(
            object_id = %object.id,
            object_type = %object.object_type,
            actor = %activity.actor_id,
            "Object created"
        );

        Ok(HandlerOutcome {
            side_effects: vec![
                SideEffect::ObjectStored {
                    object_id: object.id.clone(),
                },
                SideEffect::FanOutQueued {
                    object_id: object.id.clone(),
                    job_id,
                },
            ],
            created_objects: vec![object],
        })
    }

    /// Create/Comment: a reply checks the parent's canReply capability
    /// before the common create path runs.
    async fn handle_create_comment(
        &self,
        activity: &Activity,
    ) -> Result<HandlerOutcome, AppError> {
        let parent_ref = activity.target.as_deref().ok_or_else(|| {
            AppError::Validation("Comment objects require a target reference".to_string())
        })?;

        let parent = self
            .db
            .get_object(parent_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("object {}", parent_ref)))?;

        let viewer = self.viewer_context(&activity.actor_id).await?;
        let view = visibility::sanitize(&parent, &viewer);
        if !view.can_reply {
            return Err(AppError::Forbidden(format!(
                "{} may not reply to {}",
                activity.actor_id, parent_ref
            )));
        }

        self.handle_create(activity).await
    }

    /// Follow: add the followed actor (or `@domain` token) to the
    /// actor's following list.
    async fn handle_follow(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let followee = required_object_ref(activity)?;
        let circle = self
            .db
            .ensure_personal_circle(&activity.actor_id, CircleKind::Following)
            .await?;

        let member = self.member_snapshot(&followee).await?;
        let inserted = self.db.add_member(&circle.id, &member).await?;

        Ok(HandlerOutcome::with_effect(if inserted {
            SideEffect::MemberAdded {
                circle_id: circle.id,
                member_id: followee,
            }
        } else {
            SideEffect::MemberAlreadyPresent {
                circle_id: circle.id,
                member_id: followee,
            }
        }))
    }

    /// Unfollow: conditional removal plus cursor cleanup for the
    /// followee's domain.
    async fn handle_unfollow(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let followee = required_object_ref(activity)?;
        let circle = self
            .db
            .ensure_personal_circle(&activity.actor_id, CircleKind::Following)
            .await?;

        let removed = self.db.remove_member(&circle.id, &followee).await?;
        let mut effects = vec![if removed > 0 {
            SideEffect::MemberRemoved {
                circle_id: circle.id.clone(),
                member_id: followee.clone(),
            }
        } else {
            SideEffect::MemberAbsent {
                circle_id: circle.id.clone(),
                member_id: followee.clone(),
            }
        }];

        if removed > 0 {
            if let Some(domain) = member_domain(&followee) {
                let dropped = self
                    .db
                    .delete_cursor(&activity.actor_id, &circle.id, &domain)
                    .await?;
                if dropped > 0 {
                    effects.push(SideEffect::CursorDropped {
                        remote_domain: domain,
                    });
                }
            }
        }

        Ok(HandlerOutcome {
            created_objects: Vec::new(),
            side_effects: effects,
        })
    }

    /// React: record a reaction object against a visible target.
    async fn handle_react(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let object_ref = required_object_ref(activity)?;
        let object = self
            .db
            .get_object(&object_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("object {}", object_ref)))?;

        let viewer = self.viewer_context(&activity.actor_id).await?;
        let view = visibility::sanitize(&object, &viewer);
        if !view.can_react {
            return Err(AppError::Forbidden(format!(
                "{} may not react to {}",
                activity.actor_id, object_ref
            )));
        }

        let now = Utc::now();
        let reaction = StoredObject {
            id: EntityId::new().0,
            object_type: "Reaction".to_string(),
            actor_id: activity.actor_id.clone(),
            payload: serde_json::json!({
                "reactTo": object_ref,
                "summary": activity.summary,
            })
            .to_string(),
            summary: activity.summary.clone(),
            target: Some(object_ref.clone()),
            // A reaction inherits the audience of what it reacts to.
            to_token: object.to_token.clone(),
            can_reply: object.can_reply.clone(),
            can_react: object.can_react.clone(),
            mentions: "[]".to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.db.upsert_object(&reaction).await?;

        Ok(HandlerOutcome {
            side_effects: vec![SideEffect::ObjectStored {
                object_id: reaction.id.clone(),
            }],
            created_objects: vec![reaction],
        })
    }

    /// Unreact: retract an owned reaction.
    async fn handle_unreact(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let reaction_ref = required_object_ref(activity)?;
        let reaction = self
            .db
            .get_object(&reaction_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reaction {}", reaction_ref)))?;

        if reaction.actor_id != activity.actor_id {
            return Err(AppError::Forbidden(format!(
                "{} does not own reaction {}",
                activity.actor_id, reaction_ref
            )));
        }

        self.db.soft_delete_object(&reaction_ref).await?;
        self.db.soft_delete_timeline_entries(&reaction_ref).await?;

        Ok(HandlerOutcome::with_effect(SideEffect::ObjectRetracted {
            object_id: reaction_ref,
        }))
    }

    /// Block/Mute: conditional insert into the personal list.
    async fn handle_list_add(
        &self,
        activity: &Activity,
        kind: CircleKind,
    ) -> Result<HandlerOutcome, AppError> {
        let target_actor = required_object_ref(activity)?;
        let circle = self
            .db
            .ensure_personal_circle(&activity.actor_id, kind)
            .await?;

        let member = self.member_snapshot(&target_actor).await?;
        let inserted = self.db.add_member(&circle.id, &member).await?;

        Ok(HandlerOutcome::with_effect(if inserted {
            SideEffect::MemberAdded {
                circle_id: circle.id,
                member_id: target_actor,
            }
        } else {
            SideEffect::MemberAlreadyPresent {
                circle_id: circle.id,
                member_id: target_actor,
            }
        }))
    }

    /// Unblock/Unmute: conditional removal; absent member is a no-op.
    async fn handle_list_remove(
        &self,
        activity: &Activity,
        kind: CircleKind,
    ) -> Result<HandlerOutcome, AppError> {
        let target_actor = required_object_ref(activity)?;
        let circle = self
            .db
            .ensure_personal_circle(&activity.actor_id, kind)
            .await?;

        let removed = self.db.remove_member(&circle.id, &target_actor).await?;

        Ok(HandlerOutcome::with_effect(if removed > 0 {
            SideEffect::MemberRemoved {
                circle_id: circle.id,
                member_id: target_actor,
            }
        } else {
            SideEffect::MemberAbsent {
                circle_id: circle.id,
                member_id: target_actor,
            }
        }))
    }

    /// Add: insert a member into an owned roster circle.
    async fn handle_roster_add(&self, activity: &Activity) -> Result<HandlerOutcome, AppError> {
        let member_id = required_object_ref(activity)?;
        let circle = self.owned_circle(activity).await?;

        let member = self.member_snapshot(&member_id).await?;
        let inserted = self.db.add_member(&circle.id, &member).await?;

        Ok(HandlerOutcome::with_effect(if inserted {
            SideEffect::MemberAdded {
                circle_id: circle.id,
                member_id,
            }
        } else {
            SideEffect::MemberAlreadyPresent {
                circle_id: circle.id,
                member_id,
            }
        }))
    }

    /// Remove: pull a member from an owned roster circle.
    async fn handle_roster_remove(
        &self,
        activity: &Activity,
    ) -> Result<HandlerOutcome, AppError> {
        let member_id = required_object_ref(activity)?;
        let circle = self.owned_circle(activity).await?;

        let removed = self.db.remove_member(&circle.id, &member_id).await?;

        Ok(HandlerOutcome::with_effect(if removed > 0 {
            SideEffect::MemberRemoved {
                circle_id: circle.id,
                member_id,
            }
        } else {
            SideEffect::MemberAbsent {
                circle_id: circle.id,
                member_id,
            }
        }))
    }

    /// Resolve the `target` circle and require ownership.
    async fn owned_circle(
        &self,
        activity: &Activity,
    ) -> Result<crate::data::Circle, AppError> {
        let circle_id = activity
            .target
            .as_deref()
            .ok_or_else(|| AppError::Validation("Missing target circle".to_string()))?;

        let circle = self
            .db
            .get_circle(circle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("circle {}", circle_id)))?;

        if circle.owner_id != activity.actor_id {
            return Err(AppError::Forbidden(format!(
                "{} does not own circle {}",
                activity.actor_id, circle_id
            )));
        }

        Ok(circle)
    }

    /// Snapshot a member from the live actor record when we have one.
    async fn member_snapshot(&self, member_id: &str) -> Result<Member, AppError> {
        match self.db.get_actor(member_id).await? {
            Some(actor) => Ok(Member::from_actor(&actor)),
            None => Ok(Member::from_id(member_id)),
        }
    }

    async fn viewer_context(&self, actor_id: &str) -> Result<ViewerContext, AppError> {
        let domain =
            domain_of_actor_id(actor_id).unwrap_or_else(|| self.local_domain.clone());
        self.db.viewer_context(actor_id, &domain).await
    }
}

fn required_object_ref(activity: &Activity) -> Result<String, AppError> {
    activity
        .object_ref()
        .ok_or_else(|| AppError::Validation("Missing object reference".to_string()))
}

/// Domain a circle member lives on, for cursor bookkeeping.
///
/// Handles both actor references and `@domain` follow tokens.
fn member_domain(member_id: &str) -> Option<String> {
    if let Some(domain) = member_id.strip_prefix('@') {
        if !domain.is_empty() && domain != "public" && domain != "server" {
            return Some(domain.to_ascii_lowercase());
        }
        return None;
    }
    domain_of_actor_id(member_id)
}
