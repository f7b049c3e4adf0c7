//! Activity schema registry
//!
//! Startup-time explicit map from activity-type string to a static
//! descriptor: field requirements, the mirror type that semantically
//! undoes this one, the federation rule, and an optional cross-field
//! validate hook. An unknown type is a terminal validation error.

use std::collections::HashMap;

use crate::data::{Activity, AudienceToken};
use crate::error::AppError;

/// When and how an activity type federates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationRule {
    /// Never leaves this instance
    Never,
    /// Federates when the resolved domain of this envelope field differs
    /// from the local domain
    Field(&'static str),
}

/// Static per-type descriptor consulted by the dispatcher.
#[derive(Debug)]
pub struct ActivitySchema {
    pub activity_type: &'static str,
    /// Envelope fields that must be present
    pub required: &'static [&'static str],
    /// Envelope fields the type understands beyond the required set
    pub optional: &'static [&'static str],
    /// Activity type that semantically undoes this one
    pub mirror: Option<&'static str>,
    pub federation: FederationRule,
    /// Type-specific cross-field rules
    pub validate: Option<fn(&Activity) -> Result<(), AppError>>,
}

impl ActivitySchema {
    /// Check the required-field list against an envelope.
    pub fn check_required(&self, activity: &Activity) -> Result<(), AppError> {
        for field in self.required {
            let present = match *field {
                "actorId" => !activity.actor_id.is_empty(),
                "object" => !activity.object.is_null(),
                "objectType" => activity.object_type.is_some(),
                "target" => activity.target.is_some(),
                "to" => true, // normalization always resolves a token
                other => {
                    return Err(AppError::Validation(format!(
                        "Schema names unknown field: {}",
                        other
                    )));
                }
            };
            if !present {
                return Err(AppError::Validation(format!(
                    "Missing required field {} for {}",
                    field, self.activity_type
                )));
            }
        }
        Ok(())
    }
}

/// Registry of all known activity types.
///
/// Built once at startup; lookups are O(1).
pub struct ActivityRegistry {
    schemas: HashMap<&'static str, ActivitySchema>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        let mut schemas = HashMap::new();

        for schema in [
            ActivitySchema {
                activity_type: "Create",
                required: &["actorId", "object", "objectType", "to"],
                optional: &["target", "summary"],
                mirror: None,
                federation: FederationRule::Field("to"),
                validate: Some(validate_create),
            },
            ActivitySchema {
                activity_type: "Follow",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Unfollow"),
                federation: FederationRule::Field("object"),
                validate: Some(validate_actor_reference_object),
            },
            ActivitySchema {
                activity_type: "Unfollow",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Follow"),
                federation: FederationRule::Field("object"),
                validate: Some(validate_actor_reference_object),
            },
            ActivitySchema {
                activity_type: "React",
                required: &["actorId", "object"],
                optional: &["target", "summary"],
                mirror: Some("Unreact"),
                federation: FederationRule::Field("object"),
                validate: Some(validate_react),
            },
            ActivitySchema {
                activity_type: "Unreact",
                required: &["actorId", "object"],
                optional: &["target"],
                mirror: Some("React"),
                federation: FederationRule::Never,
                validate: None,
            },
            ActivitySchema {
                activity_type: "Block",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Unblock"),
                federation: FederationRule::Never,
                validate: Some(validate_not_self_target),
            },
            ActivitySchema {
                activity_type: "Unblock",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Block"),
                federation: FederationRule::Never,
                validate: Some(validate_not_self_target),
            },
            ActivitySchema {
                activity_type: "Mute",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Unmute"),
                federation: FederationRule::Never,
                validate: Some(validate_not_self_target),
            },
            ActivitySchema {
                activity_type: "Unmute",
                required: &["actorId", "object"],
                optional: &[],
                mirror: Some("Mute"),
                federation: FederationRule::Never,
                validate: Some(validate_not_self_target),
            },
            ActivitySchema {
                activity_type: "Add",
                required: &["actorId", "object", "target"],
                optional: &[],
                mirror: Some("Remove"),
                federation: FederationRule::Never,
                validate: Some(validate_actor_reference_object),
            },
            ActivitySchema {
                activity_type: "Remove",
                required: &["actorId", "object", "target"],
                optional: &[],
                mirror: Some("Add"),
                federation: FederationRule::Never,
                validate: Some(validate_actor_reference_object),
            },
            ActivitySchema {
                activity_type: "Undo",
                required: &["actorId", "object"],
                optional: &[],
                mirror: None,
                federation: FederationRule::Never,
                validate: None,
            },
        ] {
            schemas.insert(schema.activity_type, schema);
        }

        Self { schemas }
    }

    /// Look up a schema; unknown types are a terminal validation error,
    /// never silently ignored.
    pub fn schema(&self, activity_type: &str) -> Result<&ActivitySchema, AppError> {
        self.schemas.get(activity_type).ok_or_else(|| {
            AppError::Validation(format!("Unknown activity type: {}", activity_type))
        })
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.schemas.contains_key(activity_type)
    }

    /// The type that undoes `activity_type`, if any.
    pub fn mirror_of(&self, activity_type: &str) -> Option<&'static str> {
        self.schemas.get(activity_type).and_then(|s| s.mirror)
    }
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create rules: embedded object payload, and direct actor addressing is
/// self-notes only.
fn validate_create(activity: &Activity) -> Result<(), AppError> {
    if !activity.object.is_object() {
        return Err(AppError::Validation(
            "Create requires an embedded object payload".to_string(),
        ));
    }

    if let AudienceToken::Actor(addressee) = &activity.to {
        if *addressee != activity.actor_id {
            return Err(AppError::Validation(
                "Create addressed to a user id must address the actor itself".to_string(),
            ));
        }
    }

    // Reply-shaped objects must name what they reply to.
    if activity.object_type.as_deref() == Some("Comment") && activity.target.is_none() {
        return Err(AppError::Validation(
            "Comment objects require a target reference".to_string(),
        ));
    }

    Ok(())
}

/// React rules: the object is a bare reference to the reacted object.
fn validate_react(activity: &Activity) -> Result<(), AppError> {
    if !activity.object.is_string() {
        return Err(AppError::Validation(
            "React requires an object reference id".to_string(),
        ));
    }
    Ok(())
}

/// Membership rules: the object is a bare actor reference.
fn validate_actor_reference_object(activity: &Activity) -> Result<(), AppError> {
    match activity.object.as_str() {
        Some(reference) if !reference.is_empty() => Ok(()),
        _ => Err(AppError::Validation(format!(
            "{} requires an actor reference id",
            activity.activity_type
        ))),
    }
}

/// List mutations may not target the acting actor itself.
fn validate_not_self_target(activity: &Activity) -> Result<(), AppError> {
    validate_actor_reference_object(activity)?;
    if activity.object.as_str() == Some(activity.actor_id.as_str()) {
        return Err(AppError::Forbidden(format!(
            "{} may not target the acting actor",
            activity.activity_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn activity(activity_type: &str, actor: &str, object: serde_json::Value) -> Activity {
        Activity {
            id: "01TEST".to_string(),
            activity_type: activity_type.to_string(),
            actor_id: actor.to_string(),
            object,
            object_type: None,
            target: None,
            to: AudienceToken::Public,
            can_reply: AudienceToken::Public,
            can_react: AudienceToken::Public,
            summary: None,
            federate: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unknown_type_is_a_terminal_validation_error() {
        let registry = ActivityRegistry::new();
        let err = registry.schema("Teleport").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn mirror_pairs_are_symmetric() {
        let registry = ActivityRegistry::new();
        for (forward, reverse) in [
            ("Block", "Unblock"),
            ("Mute", "Unmute"),
            ("Follow", "Unfollow"),
            ("Add", "Remove"),
            ("React", "Unreact"),
        ] {
            assert_eq!(registry.mirror_of(forward), Some(reverse));
            assert_eq!(registry.mirror_of(reverse), Some(forward));
        }
    }

    #[test]
    fn block_rejects_self_target_as_authorization_error() {
        let registry = ActivityRegistry::new();
        let schema = registry.schema("Block").unwrap();
        let activity = activity(
            "Block",
            "alice@local.example",
            serde_json::json!("alice@local.example"),
        );
        let err = (schema.validate.unwrap())(&activity).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn create_requires_embedded_object() {
        let registry = ActivityRegistry::new();
        let schema = registry.schema("Create").unwrap();
        let activity = activity(
            "Create",
            "alice@local.example",
            serde_json::json!("just-a-reference"),
        );
        assert!((schema.validate.unwrap())(&activity).is_err());
    }

    #[test]
    fn create_addressed_to_user_id_must_be_self() {
        let registry = ActivityRegistry::new();
        let schema = registry.schema("Create").unwrap();

        let mut note_to_other = activity(
            "Create",
            "alice@local.example",
            serde_json::json!({"type": "Note", "text": "hi"}),
        );
        note_to_other.to = AudienceToken::Actor("bob@local.example".to_string());
        assert!((schema.validate.unwrap())(&note_to_other).is_err());

        let mut self_note = activity(
            "Create",
            "alice@local.example",
            serde_json::json!({"type": "Note", "text": "hi"}),
        );
        self_note.to = AudienceToken::Actor("alice@local.example".to_string());
        assert!((schema.validate.unwrap())(&self_note).is_ok());
    }

    #[test]
    fn required_fields_are_enforced() {
        let registry = ActivityRegistry::new();
        let schema = registry.schema("Add").unwrap();
        let missing_target = activity(
            "Add",
            "alice@local.example",
            serde_json::json!("bob@remote.example"),
        );
        assert!(schema.check_required(&missing_target).is_err());
    }
}
