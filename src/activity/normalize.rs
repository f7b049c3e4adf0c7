//! Activity envelope normalization
//!
//! Runs before validation and dispatch:
//! - client-supplied ids are stripped and replaced
//! - legacy `replyTo`/`reactTo` aliases promote into `canReply`/`canReact`
//! - array-valued audience fields are rejected
//! - Follow objects embedding an actor collapse to a bare id string

use chrono::Utc;

use crate::data::{Activity, AudienceToken, EntityId};
use crate::error::AppError;

/// Normalize a raw activity into an envelope.
///
/// # Errors
/// Returns [`AppError::Validation`] for missing/ill-typed `type` or
/// `actorId`, and for any array-valued audience field; exactly one
/// audience token per field, never a list.
pub fn normalize(raw: &serde_json::Value) -> Result<Activity, AppError> {
    let activity_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
        .to_string();

    let actor_id = raw
        .get("actorId")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation("Missing actorId".to_string()))?
        .to_string();

    let mut object = raw.get("object").cloned().unwrap_or(serde_json::Value::Null);

    // Follow addressing an embedded actor object collapses to its id.
    if activity_type == "Follow" || activity_type == "Unfollow" {
        if let Some(map) = object.as_object() {
            if let Some(id) = map.get("id").and_then(|v| v.as_str()) {
                object = serde_json::Value::String(id.to_string());
            }
        }
    }

    let object_type = raw
        .get("objectType")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            object
                .get("type")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

    let target = raw
        .get("target")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let summary = raw
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    // Audience fields: the actor itself is the default addressee when
    // nothing was supplied, keeping unaddressed activities private.
    let to = audience_field(raw, "to", None)?
        .unwrap_or_else(|| AudienceToken::Actor(actor_id.clone()));
    let can_reply =
        audience_field(raw, "canReply", Some("replyTo"))?.unwrap_or_else(|| to.clone());
    let can_react =
        audience_field(raw, "canReact", Some("reactTo"))?.unwrap_or_else(|| to.clone());

    Ok(Activity {
        // Any client-supplied id is discarded.
        id: EntityId::new().0,
        activity_type,
        actor_id,
        object,
        object_type,
        target,
        to,
        can_reply,
        can_react,
        summary,
        federate: false,
        created_at: Utc::now(),
    })
}

/// Read one audience field, honoring its legacy alias when the canonical
/// field is absent.
fn audience_field(
    raw: &serde_json::Value,
    field: &str,
    legacy_alias: Option<&str>,
) -> Result<Option<AudienceToken>, AppError> {
    let value = match raw.get(field) {
        Some(v) if !v.is_null() => Some((field.to_string(), v)),
        _ => legacy_alias.and_then(|alias| {
            raw.get(alias)
                .filter(|v| !v.is_null())
                .map(|v| (alias.to_string(), v))
        }),
    };

    match value {
        None => Ok(None),
        Some((name, serde_json::Value::String(token))) => {
            if token.is_empty() {
                return Err(AppError::Validation(format!("Empty audience field {}", name)));
            }
            Ok(Some(AudienceToken::parse(token)))
        }
        Some((name, serde_json::Value::Array(_))) => Err(AppError::Validation(format!(
            "Audience field {} must be a single token, not an array",
            name
        ))),
        Some((name, _)) => Err(AppError::Validation(format!(
            "Audience field {} must be a string token",
            name
        ))),
    }
}
