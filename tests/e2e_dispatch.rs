//! E2E tests for activity dispatch
//!
//! Covers the dispatch state machine end to end: normalization
//! failures, idempotent list mutations, mirror-based Undo, audience
//! authority checks, and hook swallowing.

mod common;

use common::TestApp;
use lagoon::activity::SideEffect;
use lagoon::data::CircleKind;

fn block(actor: &str, target: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "Block",
        "actorId": actor,
        "object": target,
    })
}

fn create_note(actor: &str, to: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "Create",
        "actorId": actor,
        "object": {"type": "Note", "text": "hello"},
        "to": to,
    })
}

#[tokio::test]
async fn block_adds_member_once_and_reissue_is_a_noop() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    // First Block inserts the member.
    let report = app
        .state
        .dispatcher
        .dispatch(&block("alice@test.example.com", "bob@remote.example"))
        .await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert!(matches!(
        report.side_effects.as_slice(),
        [SideEffect::MemberAdded { .. }]
    ));

    // Re-issuing the same Block leaves the member count unchanged.
    let replay = app
        .state
        .dispatcher
        .dispatch(&block("alice@test.example.com", "bob@remote.example"))
        .await;
    assert!(replay.error.is_none());
    assert!(matches!(
        replay.side_effects.as_slice(),
        [SideEffect::MemberAlreadyPresent { .. }]
    ));

    let circle = app
        .state
        .db
        .ensure_personal_circle("alice@test.example.com", CircleKind::Blocked)
        .await
        .unwrap();
    assert_eq!(circle.member_count, 1);
    assert_eq!(app.state.db.members_of(&circle.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unblock_of_absent_member_modifies_nothing() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Unblock",
            "actorId": "alice@test.example.com",
            "object": "stranger@remote.example",
        }))
        .await;

    assert!(report.error.is_none());
    assert!(matches!(
        report.side_effects.as_slice(),
        [SideEffect::MemberAbsent { .. }]
    ));

    let circle = app
        .state
        .db
        .ensure_personal_circle("alice@test.example.com", CircleKind::Blocked)
        .await
        .unwrap();
    assert_eq!(circle.member_count, 0);
}

#[tokio::test]
async fn array_valued_audience_is_rejected_before_dispatch() {
    let app = TestApp::new().await;

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Create",
            "actorId": "alice@test.example.com",
            "object": {"type": "Note"},
            "to": ["@public", "circle:c1"],
        }))
        .await;

    let error = report.error.expect("array audience must be rejected");
    assert!(error.contains("array"), "unexpected error: {}", error);
    assert!(report.side_effects.is_empty());
}

#[tokio::test]
async fn unknown_activity_type_is_a_terminal_error() {
    let app = TestApp::new().await;

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Teleport",
            "actorId": "alice@test.example.com",
            "object": "somewhere",
        }))
        .await;

    let error = report.error.expect("unknown type must be rejected");
    assert!(error.contains("Unknown activity type"));
}

#[tokio::test]
async fn blocking_yourself_is_denied() {
    let app = TestApp::new().await;

    let report = app
        .state
        .dispatcher
        .dispatch(&block("alice@test.example.com", "alice@test.example.com"))
        .await;

    let error = report.error.expect("self-block must be denied");
    assert!(error.contains("Access denied"), "unexpected error: {}", error);
}

#[tokio::test]
async fn undo_resolves_the_mirror_from_the_registry() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let blocked = app
        .state
        .dispatcher
        .dispatch(&block("alice@test.example.com", "bob@remote.example"))
        .await;
    let block_id = blocked.activity.unwrap()["id"].as_str().unwrap().to_string();

    // Undo of the Block runs the Unblock handler generically.
    let undone = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Undo",
            "actorId": "alice@test.example.com",
            "object": block_id,
        }))
        .await;

    assert!(undone.error.is_none(), "{:?}", undone.error);
    assert!(matches!(
        undone.side_effects.as_slice(),
        [SideEffect::MemberRemoved { .. }]
    ));

    let circle = app
        .state
        .db
        .ensure_personal_circle("alice@test.example.com", CircleKind::Blocked)
        .await
        .unwrap();
    assert_eq!(circle.member_count, 0);
}

#[tokio::test]
async fn undo_of_someone_elses_activity_is_denied() {
    let app = TestApp::new().await;

    let blocked = app
        .state
        .dispatcher
        .dispatch(&block("alice@test.example.com", "bob@remote.example"))
        .await;
    let block_id = blocked.activity.unwrap()["id"].as_str().unwrap().to_string();

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Undo",
            "actorId": "mallory@test.example.com",
            "object": block_id,
        }))
        .await;

    let error = report.error.expect("foreign undo must be denied");
    assert!(error.contains("Access denied"));
}

#[tokio::test]
async fn undo_of_a_create_is_not_undoable() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let created = app
        .state
        .dispatcher
        .dispatch(&create_note("alice@test.example.com", "@public"))
        .await;
    let create_id = created.activity.unwrap()["id"].as_str().unwrap().to_string();

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Undo",
            "actorId": "alice@test.example.com",
            "object": create_id,
        }))
        .await;

    let error = report.error.expect("Create has no mirror");
    assert!(error.contains("not undoable"));
}

#[tokio::test]
async fn create_stores_the_object_and_queues_fanout() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let report = app
        .state
        .dispatcher
        .dispatch(&create_note("alice@test.example.com", "@public"))
        .await;

    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(report.created_objects.len(), 1);
    assert!(report
        .side_effects
        .iter()
        .any(|e| matches!(e, SideEffect::ObjectStored { .. })));
    assert!(report
        .side_effects
        .iter()
        .any(|e| matches!(e, SideEffect::FanOutQueued { .. })));

    let object_id = &report.created_objects[0];
    let object = app.state.db.get_object(object_id).await.unwrap().unwrap();
    assert_eq!(object.to_token, "@public");

    // The dispatched envelope is on the activity log.
    let activity_id = report.activity.unwrap()["id"].as_str().unwrap().to_string();
    assert!(app
        .state
        .db
        .get_activity(&activity_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn addressing_a_circle_requires_membership_or_ownership() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;
    app.create_local_actor("mallory@test.example.com").await;

    let circle = app
        .state
        .db
        .create_circle("alice@test.example.com", CircleKind::Roster, "friends")
        .await
        .unwrap();

    // Owner may address the circle.
    let owner_report = app
        .state
        .dispatcher
        .dispatch(&create_note(
            "alice@test.example.com",
            &format!("circle:{}", circle.id),
        ))
        .await;
    assert!(owner_report.error.is_none(), "{:?}", owner_report.error);

    // A non-member may not.
    let outsider_report = app
        .state
        .dispatcher
        .dispatch(&create_note(
            "mallory@test.example.com",
            &format!("circle:{}", circle.id),
        ))
        .await;
    let error = outsider_report.error.expect("non-member must be denied");
    assert!(error.contains("Access denied"));

    // A missing circle is NotFound, not silently public.
    let missing_report = app
        .state
        .dispatcher
        .dispatch(&create_note("alice@test.example.com", "circle:does-not-exist"))
        .await;
    assert!(missing_report.error.unwrap().contains("not found"));
}

#[tokio::test]
async fn roster_add_and_remove_require_ownership_and_are_idempotent() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let circle = app
        .state
        .db
        .create_circle("alice@test.example.com", CircleKind::Roster, "crew")
        .await
        .unwrap();

    let add = serde_json::json!({
        "type": "Add",
        "actorId": "alice@test.example.com",
        "object": "bob@remote.example",
        "target": circle.id,
    });

    let first = app.state.dispatcher.dispatch(&add).await;
    assert!(first.error.is_none(), "{:?}", first.error);
    assert!(matches!(
        first.side_effects.as_slice(),
        [SideEffect::MemberAdded { .. }]
    ));

    let second = app.state.dispatcher.dispatch(&add).await;
    assert!(matches!(
        second.side_effects.as_slice(),
        [SideEffect::MemberAlreadyPresent { .. }]
    ));

    // Only the owner may mutate the roster.
    let foreign = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Remove",
            "actorId": "mallory@test.example.com",
            "object": "bob@remote.example",
            "target": circle.id,
        }))
        .await;
    assert!(foreign.error.unwrap().contains("Access denied"));

    let remove = serde_json::json!({
        "type": "Remove",
        "actorId": "alice@test.example.com",
        "object": "bob@remote.example",
        "target": circle.id,
    });
    let removed = app.state.dispatcher.dispatch(&remove).await;
    assert!(matches!(
        removed.side_effects.as_slice(),
        [SideEffect::MemberRemoved { .. }]
    ));

    let again = app.state.dispatcher.dispatch(&remove).await;
    assert!(matches!(
        again.side_effects.as_slice(),
        [SideEffect::MemberAbsent { .. }]
    ));
}

#[tokio::test]
async fn hook_failures_are_swallowed_not_fatal() {
    use std::sync::Arc;
    use std::time::Duration;

    use lagoon::activity::{ActivityRegistry, Dispatcher, Handlers, HookSet};
    use lagoon::federation::{DeliveryQueue, DeliverySettings};

    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    // A dispatcher whose audit hook fails from the second Create on.
    let delivery = Arc::new(DeliveryQueue::new(
        app.state.db.clone(),
        app.state.http_client.clone(),
        DeliverySettings {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(10),
            job_ttl_seconds: 3600,
            local_domain: "test.example.com".to_string(),
            protocol: "https".to_string(),
        },
    ));
    let dispatcher = Dispatcher::new(
        app.state.db.clone(),
        Arc::new(ActivityRegistry::new()),
        Handlers::new(app.state.db.clone(), "test.example.com".to_string(), 5),
        Arc::new(HookSet::with_audit_limit(1, Duration::from_secs(60))),
        delivery,
        "test.example.com".to_string(),
    );

    let first = dispatcher
        .dispatch(&create_note("alice@test.example.com", "@public"))
        .await;
    assert!(first.error.is_none());

    // The before hook errors now, but the handler still runs.
    let second = dispatcher
        .dispatch(&create_note("alice@test.example.com", "@public"))
        .await;
    assert!(second.error.is_none(), "{:?}", second.error);
    assert_eq!(second.created_objects.len(), 1);
}

#[tokio::test]
async fn react_honors_the_can_react_audience() {
    use lagoon::data::StoredObject;

    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;
    app.create_local_actor("bob@test.example.com").await;

    // Public note, but reactions restricted to the author.
    let object = StoredObject {
        id: "obj-guarded".to_string(),
        object_type: "Note".to_string(),
        actor_id: "alice@test.example.com".to_string(),
        payload: r#"{"text":"no reactions please"}"#.to_string(),
        summary: None,
        target: None,
        to_token: "@public".to_string(),
        can_reply: "@public".to_string(),
        can_react: "alice@test.example.com".to_string(),
        mentions: "[]".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    };
    app.state.db.upsert_object(&object).await.unwrap();

    let react = |actor: &str| {
        serde_json::json!({
            "type": "React",
            "actorId": actor,
            "object": "obj-guarded",
            "summary": "🔥",
        })
    };

    // Bob lacks the capability.
    let denied = app
        .state
        .dispatcher
        .dispatch(&react("bob@test.example.com"))
        .await;
    assert!(denied.error.unwrap().contains("Access denied"));

    // Alice may react; the reaction is a stored object.
    let allowed = app
        .state
        .dispatcher
        .dispatch(&react("alice@test.example.com"))
        .await;
    assert!(allowed.error.is_none(), "{:?}", allowed.error);
    assert_eq!(allowed.created_objects.len(), 1);

    let reaction_id = allowed.created_objects[0].clone();
    let reaction = app.state.db.get_object(&reaction_id).await.unwrap().unwrap();
    assert_eq!(reaction.object_type, "Reaction");
    assert_eq!(reaction.target.as_deref(), Some("obj-guarded"));

    // Only the owner may retract it.
    let foreign_unreact = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Unreact",
            "actorId": "bob@test.example.com",
            "object": reaction_id,
        }))
        .await;
    assert!(foreign_unreact.error.unwrap().contains("Access denied"));

    let unreact = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Unreact",
            "actorId": "alice@test.example.com",
            "object": reaction_id,
        }))
        .await;
    assert!(unreact.error.is_none(), "{:?}", unreact.error);

    let retracted = app.state.db.get_object(&reaction_id).await.unwrap().unwrap();
    assert!(retracted.deleted_at.is_some());
}

#[tokio::test]
async fn comments_honor_the_can_reply_audience_of_the_parent() {
    use lagoon::data::StoredObject;

    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;
    app.create_local_actor("bob@test.example.com").await;

    // Public note; replies restricted to the author.
    let parent = StoredObject {
        id: "obj-parent".to_string(),
        object_type: "Note".to_string(),
        actor_id: "alice@test.example.com".to_string(),
        payload: r#"{"text":"replies closed"}"#.to_string(),
        summary: None,
        target: None,
        to_token: "@public".to_string(),
        can_reply: "alice@test.example.com".to_string(),
        can_react: "@public".to_string(),
        mentions: "[]".to_string(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    };
    app.state.db.upsert_object(&parent).await.unwrap();

    let comment = |actor: &str| {
        serde_json::json!({
            "type": "Create",
            "actorId": actor,
            "object": {"type": "Comment", "text": "well actually"},
            "target": "obj-parent",
            "to": "@public",
        })
    };

    let denied = app
        .state
        .dispatcher
        .dispatch(&comment("bob@test.example.com"))
        .await;
    assert!(denied.error.unwrap().contains("Access denied"));

    let allowed = app
        .state
        .dispatcher
        .dispatch(&comment("alice@test.example.com"))
        .await;
    assert!(allowed.error.is_none(), "{:?}", allowed.error);
    assert_eq!(allowed.created_objects.len(), 1);

    // A Comment without a target never reaches the handler.
    let dangling = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "Create",
            "actorId": "alice@test.example.com",
            "object": {"type": "Comment", "text": "to nothing"},
            "to": "@public",
        }))
        .await;
    assert!(dangling.error.unwrap().contains("target"));
}

#[tokio::test]
async fn reacting_to_a_missing_object_is_not_found() {
    let app = TestApp::new().await;

    let report = app
        .state
        .dispatcher
        .dispatch(&serde_json::json!({
            "type": "React",
            "actorId": "alice@test.example.com",
            "object": "no-such-object",
        }))
        .await;

    assert!(report.error.unwrap().contains("not found"));
}

#[tokio::test]
async fn dispatch_endpoint_returns_tagged_reports() {
    let app = TestApp::new().await;
    app.create_local_actor("alice@test.example.com").await;

    let ok = app
        .client
        .post(app.url("/outbox"))
        .json(&create_note("alice@test.example.com", "@public"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let body: serde_json::Value = ok.json().await.unwrap();
    assert!(body["error"].is_null());
    assert_eq!(body["federate"], false);

    let bad = app
        .client
        .post(app.url("/outbox"))
        .json(&serde_json::json!({
            "type": "Create",
            "actorId": "alice@test.example.com",
            "object": {"type": "Note"},
            "to": ["@public"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
    let body: serde_json::Value = bad.json().await.unwrap();
    assert!(body["error"].is_string());
}
