//! Visibility / audience resolution
//!
//! Builds a declarative predicate from a viewer context. The same
//! predicate renders as an in-memory check for a single object and as a
//! structured WHERE clause for collection scans, so read paths cannot
//! drift apart.

use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use crate::data::{AudienceToken, StoredObject, ViewerContext};

/// Declarative visibility predicate for one viewer.
///
/// An object is visible when ANY of the following holds:
/// - its `to` is `@public`
/// - its `to` is `@<viewer domain>`
/// - its `to` is the legacy `@server` token AND the author's domain
///   equals the viewer's domain
/// - its `to` names a circle/group the viewer belongs to
/// - the viewer is the author
///
/// Objects authored by a blocked actor are excluded unless the viewer is
/// the author. For anonymous viewers everything collapses to `@public`.
#[derive(Debug, Clone)]
pub struct VisibilityFilter {
    pub viewer_id: Option<String>,
    pub viewer_domain: String,
    /// Wire-form tokens for the viewer's circles and groups
    pub circle_tokens: Vec<String>,
    pub blocked_actor_ids: Vec<String>,
}

/// Build the visibility predicate for a viewer context.
pub fn build_visibility_filter(viewer: &ViewerContext) -> VisibilityFilter {
    let mut circle_tokens = Vec::new();
    if viewer.viewer_id.is_some() {
        for id in &viewer.circle_ids {
            circle_tokens.push(format!("circle:{}", id));
            circle_tokens.push(format!("group:{}", id));
        }
        circle_tokens.sort();
    }

    let mut blocked: Vec<String> = viewer.blocked_actor_ids.iter().cloned().collect();
    blocked.sort();

    VisibilityFilter {
        viewer_id: viewer.viewer_id.clone(),
        viewer_domain: viewer.viewer_domain.clone(),
        circle_tokens,
        blocked_actor_ids: blocked,
    }
}

impl VisibilityFilter {
    /// In-memory form of the predicate: single-object check.
    pub fn matches(&self, object: &StoredObject) -> bool {
        if object.deleted_at.is_some() {
            return false;
        }

        let viewer_is_author = self
            .viewer_id
            .as_deref()
            .is_some_and(|viewer| viewer == object.actor_id);

        // The author always sees their own objects, blocked or not.
        if viewer_is_author {
            return true;
        }

        if self.blocked_actor_ids.iter().any(|b| *b == object.actor_id) {
            return false;
        }

        match object.to() {
            AudienceToken::Public => true,
            AudienceToken::Domain(domain) => {
                self.viewer_id.is_some() && domain == self.viewer_domain
            }
            // Compatibility arm for objects stored before the explicit
            // domain token; removable once stored audiences are migrated.
            AudienceToken::LegacyServer => {
                self.viewer_id.is_some()
                    && object
                        .actor_domain()
                        .is_some_and(|author_domain| author_domain == self.viewer_domain)
            }
            AudienceToken::Circle(_) | AudienceToken::Group(_) => {
                let token = object.to_token.as_str();
                self.circle_tokens.iter().any(|t| t == token)
            }
            AudienceToken::Actor(id) => self.viewer_id.as_deref() == Some(id.as_str()),
        }
    }

    /// Structured-query form of the predicate.
    ///
    /// Appends a parenthesized boolean expression over the `objects`
    /// columns to the builder. Mirrors [`Self::matches`] exactly.
    pub fn push_sql(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push("(");

        // Audience arms.
        builder.push("(to_token = '@public'");

        if let Some(viewer_id) = &self.viewer_id {
            builder.push(" OR to_token = ");
            builder.push_bind(format!("@{}", self.viewer_domain));

            // Legacy `@server`: author domain must match the viewer's.
            // Stored ids are either `user@domain` or URLs with the domain
            // in the authority, so a suffix/substring match on the actor
            // id is the query-side equivalent of actor_domain().
            builder.push(" OR (to_token = '@server' AND (actor_id LIKE ");
            builder.push_bind(format!("%@{}", self.viewer_domain));
            builder.push(" OR actor_id LIKE ");
            builder.push_bind(format!("%://{}/%", self.viewer_domain));
            builder.push("))");

            if !self.circle_tokens.is_empty() {
                builder.push(" OR to_token IN (");
                let mut separated = builder.separated(", ");
                for token in &self.circle_tokens {
                    separated.push_bind(token.clone());
                }
                builder.push(")");
            }

            builder.push(" OR to_token = ");
            builder.push_bind(viewer_id.clone());
        }

        builder.push(")");

        // Author arm plus blocked-author exclusion.
        if let Some(viewer_id) = &self.viewer_id {
            if !self.blocked_actor_ids.is_empty() {
                builder.push(" AND (actor_id = ");
                builder.push_bind(viewer_id.clone());
                builder.push(" OR actor_id NOT IN (");
                let mut separated = builder.separated(", ");
                for blocked in &self.blocked_actor_ids {
                    separated.push_bind(blocked.clone());
                }
                builder.push("))");
            }
            builder.push(" OR actor_id = ");
            builder.push_bind(viewer_id.clone());
        }

        builder.push(")");
    }
}

/// Public view of an object, safe to return to any caller.
///
/// Circle/group ids in the audience fields are never echoed back to
/// non-members; only derived booleans relative to the current viewer.
#[derive(Debug, Clone, Serialize)]
pub struct PublicView {
    pub id: String,
    pub object_type: String,
    pub actor_id: String,
    pub payload: serde_json::Value,
    pub summary: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub can_share: bool,
    pub can_reply: bool,
    pub can_react: bool,
}

/// Sanitize an object for a viewer.
///
/// The raw `to`/`canReply`/`canReact` tokens are replaced with derived
/// capability booleans evaluated against the viewer context.
pub fn sanitize(object: &StoredObject, viewer: &ViewerContext) -> PublicView {
    PublicView {
        id: object.id.clone(),
        object_type: object.object_type.clone(),
        actor_id: object.actor_id.clone(),
        payload: serde_json::from_str(&object.payload)
            .unwrap_or(serde_json::Value::Null),
        summary: object.summary.clone(),
        created_at: object.created_at,
        can_share: audience_allows(&AudienceToken::parse(&object.to_token), object, viewer),
        can_reply: audience_allows(&AudienceToken::parse(&object.can_reply), object, viewer),
        can_react: audience_allows(&AudienceToken::parse(&object.can_react), object, viewer),
    }
}

/// Evaluate one audience token against the viewer.
fn audience_allows(token: &AudienceToken, object: &StoredObject, viewer: &ViewerContext) -> bool {
    if viewer.viewer_id.as_deref() == Some(object.actor_id.as_str()) {
        return true;
    }

    match token {
        AudienceToken::Public => true,
        AudienceToken::Domain(domain) => {
            viewer.viewer_id.is_some() && *domain == viewer.viewer_domain
        }
        AudienceToken::LegacyServer => {
            viewer.viewer_id.is_some()
                && object
                    .actor_domain()
                    .is_some_and(|author_domain| author_domain == viewer.viewer_domain)
        }
        AudienceToken::Circle(id) | AudienceToken::Group(id) => viewer.circle_ids.contains(id),
        AudienceToken::Actor(id) => viewer.viewer_id.as_deref() == Some(id.as_str()),
    }
}
