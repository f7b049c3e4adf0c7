//! Data models
//!
//! Rust structs representing database entities and dispatch envelopes.
//! All models use ULID for IDs and chrono for timestamps.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Audience tokens
// =============================================================================

/// A single audience token.
///
/// Each of `to`, `canReply` and `canReact` carries exactly one of these;
/// arrays are rejected during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AudienceToken {
    /// `@public`: everyone, authenticated or not
    Public,
    /// `@<domain>`: every viewer on one domain
    Domain(String),
    /// `@server`: stored objects predating the explicit domain token.
    /// Matches viewers sharing the author's domain.
    LegacyServer,
    /// `circle:<id>`: members of a circle
    Circle(String),
    /// `group:<id>`: members of a group roster
    Group(String),
    /// A bare actor id
    Actor(String),
}

impl AudienceToken {
    /// Parse a token from its wire form.
    pub fn parse(raw: &str) -> Self {
        if raw == "@public" {
            return Self::Public;
        }
        if raw == "@server" {
            return Self::LegacyServer;
        }
        if let Some(domain) = raw.strip_prefix('@') {
            return Self::Domain(domain.to_string());
        }
        if let Some(id) = raw.strip_prefix("circle:") {
            return Self::Circle(id.to_string());
        }
        if let Some(id) = raw.strip_prefix("group:") {
            return Self::Group(id.to_string());
        }
        Self::Actor(raw.to_string())
    }

    /// Wire form of the token.
    pub fn as_wire(&self) -> String {
        match self {
            Self::Public => "@public".to_string(),
            Self::Domain(domain) => format!("@{}", domain),
            Self::LegacyServer => "@server".to_string(),
            Self::Circle(id) => format!("circle:{}", id),
            Self::Group(id) => format!("group:{}", id),
            Self::Actor(id) => id.clone(),
        }
    }

    /// Circle or group id, if this token names one.
    pub fn circle_id(&self) -> Option<&str> {
        match self {
            Self::Circle(id) | Self::Group(id) => Some(id),
            _ => None,
        }
    }

    /// Timeline scope implied by this audience.
    pub fn scope(&self) -> TimelineScope {
        match self {
            Self::Public => TimelineScope::Public,
            Self::Domain(_) | Self::LegacyServer => TimelineScope::Server,
            Self::Circle(_) | Self::Group(_) | Self::Actor(_) => TimelineScope::Circle,
        }
    }
}

// =============================================================================
// Activity envelope
// =============================================================================

/// A normalized activity envelope.
///
/// Produced by normalization, consumed exactly once by the dispatcher.
/// Never mutated after dispatch completes except to record the
/// federation decision.
#[derive(Debug, Clone)]
pub struct Activity {
    /// Server-assigned id (client-supplied ids are stripped)
    pub id: String,
    /// Verb, e.g. Create / Follow / Block / Undo
    pub activity_type: String,
    pub actor_id: String,
    /// Embedded payload or a reference id string
    pub object: serde_json::Value,
    pub object_type: Option<String>,
    /// Secondary reference (reply target, circle id, ...)
    pub target: Option<String>,
    pub to: AudienceToken,
    pub can_reply: AudienceToken,
    pub can_react: AudienceToken,
    pub summary: Option<String>,
    /// Set by handlers when the resolved audience is remote
    pub federate: bool,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    /// Object reference id: the embedded payload's id, or the bare
    /// reference string itself.
    pub fn object_ref(&self) -> Option<String> {
        match &self.object {
            serde_json::Value::String(id) => Some(id.clone()),
            serde_json::Value::Object(map) => map
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        }
    }
}

/// Persisted row in the dispatched-activity log
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub id: String,
    pub activity_type: String,
    pub actor_id: String,
    pub object_ref: String,
    pub object_type: Option<String>,
    pub target: Option<String>,
    pub to_token: String,
    pub can_reply: String,
    pub can_react: String,
    pub summary: Option<String>,
    pub federate: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Actors
// =============================================================================

/// A local or remote actor known to this instance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    pub domain: String,
    pub is_local: bool,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Circles
// =============================================================================

/// Circle kinds: personal lists plus named rosters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircleKind {
    Blocked,
    Muted,
    Following,
    Roster,
}

impl CircleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Muted => "muted",
            Self::Following => "following",
            Self::Roster => "roster",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Self::Blocked),
            "muted" => Some(Self::Muted),
            "following" => Some(Self::Following),
            "roster" => Some(Self::Roster),
            _ => None,
        }
    }
}

/// A named set of members with an owner
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Circle {
    pub id: String,
    pub owner_id: String,
    pub kind: String,
    pub name: String,
    /// Guarded counter; never driven below zero
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Denormalized snapshot of an actor inside a circle.
///
/// Intentionally redundant with the live actor record so visibility
/// checks never require a cross-peer fetch. Refreshed on write; staleness
/// between writes is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Member {
    pub member_id: String,
    pub name: Option<String>,
    pub icon: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub url: Option<String>,
    pub server: Option<String>,
}

impl Member {
    /// Build a snapshot from an actor record.
    pub fn from_actor(actor: &Actor) -> Self {
        Self {
            member_id: actor.id.clone(),
            name: actor.name.clone(),
            icon: actor.icon.clone(),
            inbox: actor.inbox.clone(),
            outbox: actor.outbox.clone(),
            url: actor.url.clone(),
            server: Some(actor.domain.clone()),
        }
    }

    /// Minimal snapshot when only the id is known.
    pub fn from_id(member_id: &str) -> Self {
        Self {
            member_id: member_id.to_string(),
            name: None,
            icon: None,
            inbox: None,
            outbox: None,
            url: None,
            server: domain_of_actor_id(member_id),
        }
    }
}

/// Best-effort domain extraction from an actor id.
///
/// Accepts `user@domain` addresses and https ids.
pub fn domain_of_actor_id(actor_id: &str) -> Option<String> {
    if let Some((_, domain)) = actor_id.rsplit_once('@') {
        if !domain.is_empty() && !domain.contains('/') {
            return Some(domain.to_ascii_lowercase());
        }
    }
    url::Url::parse(actor_id)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

// =============================================================================
// Stored objects
// =============================================================================

/// A stored object produced by a Create handler
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredObject {
    pub id: String,
    pub object_type: String,
    pub actor_id: String,
    /// Raw payload JSON
    pub payload: String,
    pub summary: Option<String>,
    pub target: Option<String>,
    pub to_token: String,
    pub can_reply: String,
    pub can_react: String,
    /// JSON array of mentioned actor ids
    pub mentions: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredObject {
    pub fn to(&self) -> AudienceToken {
        AudienceToken::parse(&self.to_token)
    }

    pub fn mentions(&self) -> Vec<String> {
        serde_json::from_str(&self.mentions).unwrap_or_default()
    }

    /// Domain of the authoring actor, used by the legacy `@server` arm.
    pub fn actor_domain(&self) -> Option<String> {
        domain_of_actor_id(&self.actor_id)
    }
}

// =============================================================================
// Timelines
// =============================================================================

/// Why an entry landed in a viewer's timeline.
///
/// Priority when several apply: self > circle > follow > mention > domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineReason {
    Own,
    Circle,
    Follow,
    Mention,
    Domain,
}

impl TimelineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Own => "self",
            Self::Circle => "circle",
            Self::Follow => "follow",
            Self::Mention => "mention",
            Self::Domain => "domain",
        }
    }
}

/// Audience breadth recorded on a timeline entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineScope {
    Public,
    Server,
    Circle,
}

impl TimelineScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Server => "server",
            Self::Circle => "circle",
        }
    }
}

/// One materialized row per (viewer, object)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimelineEntry {
    pub id: String,
    pub viewer_id: String,
    pub object_id: String,
    pub object_type: String,
    /// Source object's timestamp; sort key, not fan-out time
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub scope: String,
    /// Internal bookkeeping; never exposed through the API
    pub local_circle_id: Option<String>,
    /// Small rendering-only snapshot JSON
    pub snapshot: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Federation delivery
// =============================================================================

/// Delivery job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Audit snapshot of the audience a job was created for.
///
/// Used for operator inspection only; never re-resolved for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceSnapshot {
    pub to: String,
    pub can_reply: String,
    pub can_react: String,
    /// Resolved local addressee ids at enqueue time
    pub local_addressees: Vec<String>,
}

/// One row per outbound fan-out batch
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    pub object_id: String,
    pub status: String,
    /// JSON-encoded [`AudienceSnapshot`]
    pub audience: String,
    /// JSON array of recipient domains still owed this delivery
    pub domains: String,
    /// JSON map of per-reason delivered tallies
    pub counts: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dedupe_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryJob {
    pub fn pending_domains(&self) -> Vec<String> {
        serde_json::from_str(&self.domains).unwrap_or_default()
    }

    pub fn audience_snapshot(&self) -> Option<AudienceSnapshot> {
        serde_json::from_str(&self.audience).ok()
    }

    pub fn counts_by_reason(&self) -> HashMap<String, i64> {
        serde_json::from_str(&self.counts).unwrap_or_default()
    }
}

/// Queued asynchronous timeline fan-out work
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FanoutJob {
    pub id: String,
    pub object_id: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Federation pull
// =============================================================================

/// Incremental sync cursor per (viewer, circle, remote domain)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FederationCursor {
    pub id: String,
    pub viewer_id: String,
    pub circle_id: String,
    pub remote_domain: String,
    /// Opaque progress marker
    pub since: String,
    /// Hash over the normalized actor set + filter set. A mismatch
    /// invalidates `since` without deleting the row.
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Replay-defense record for a verified inbound signature
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignatureNonce {
    pub signature_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Viewer context
// =============================================================================

/// Per-request view of who is reading.
///
/// Ephemeral: recomputed per read, never persisted.
#[derive(Debug, Clone, Default)]
pub struct ViewerContext {
    pub viewer_id: Option<String>,
    pub viewer_domain: String,
    pub circle_ids: HashSet<String>,
    pub blocked_actor_ids: HashSet<String>,
}

impl ViewerContext {
    /// Anonymous viewer: sees `@public` only.
    pub fn anonymous(viewer_domain: &str) -> Self {
        Self {
            viewer_id: None,
            viewer_domain: viewer_domain.to_string(),
            circle_ids: HashSet::new(),
            blocked_actor_ids: HashSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_token_parses_every_form() {
        assert_eq!(AudienceToken::parse("@public"), AudienceToken::Public);
        assert_eq!(AudienceToken::parse("@server"), AudienceToken::LegacyServer);
        assert_eq!(
            AudienceToken::parse("@social.example"),
            AudienceToken::Domain("social.example".to_string())
        );
        assert_eq!(
            AudienceToken::parse("circle:01ABC"),
            AudienceToken::Circle("01ABC".to_string())
        );
        assert_eq!(
            AudienceToken::parse("group:01DEF"),
            AudienceToken::Group("01DEF".to_string())
        );
        assert_eq!(
            AudienceToken::parse("alice@social.example"),
            AudienceToken::Actor("alice@social.example".to_string())
        );
    }

    #[test]
    fn audience_token_round_trips_wire_form() {
        for raw in [
            "@public",
            "@server",
            "@social.example",
            "circle:01ABC",
            "group:01DEF",
            "alice@social.example",
        ] {
            assert_eq!(AudienceToken::parse(raw).as_wire(), raw);
        }
    }

    #[test]
    fn audience_token_scope_maps_breadth() {
        assert_eq!(AudienceToken::Public.scope(), TimelineScope::Public);
        assert_eq!(
            AudienceToken::Domain("x.org".to_string()).scope(),
            TimelineScope::Server
        );
        assert_eq!(
            AudienceToken::Circle("c1".to_string()).scope(),
            TimelineScope::Circle
        );
    }

    #[test]
    fn domain_of_actor_id_handles_addresses_and_urls() {
        assert_eq!(
            domain_of_actor_id("alice@social.example"),
            Some("social.example".to_string())
        );
        assert_eq!(
            domain_of_actor_id("https://social.example/users/alice"),
            Some("social.example".to_string())
        );
        assert_eq!(domain_of_actor_id("not a reference"), None);
    }

    #[test]
    fn member_snapshot_from_actor_copies_denormalized_fields() {
        let actor = Actor {
            id: "bob@remote.example".to_string(),
            domain: "remote.example".to_string(),
            is_local: false,
            name: Some("Bob".to_string()),
            icon: None,
            inbox: Some("https://remote.example/users/bob/inbox".to_string()),
            outbox: None,
            url: Some("https://remote.example/@bob".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let member = Member::from_actor(&actor);
        assert_eq!(member.member_id, "bob@remote.example");
        assert_eq!(member.server.as_deref(), Some("remote.example"));
        assert_eq!(
            member.inbox.as_deref(),
            Some("https://remote.example/users/bob/inbox")
        );
    }
}
