//! Contact lifecycle integration tests
//!
//! Exercises the engine API over in-memory adapters: recording pending
//! contacts, accepting and rejecting them, mutual acceptance across two
//! peers sharing one store, and credential revocation. No network
//! operations are involved; the recording transport stands in for wire
//! delivery.

use std::sync::Arc;

use commlink_core::{
    AcceptOptions, CommEngine, CommError, ContactCredential, CorePolicy, MemoryStore, PayloadKind,
    PendingId, PersonId, RetryPolicy,
};

fn policy() -> CorePolicy {
    init_tracing();
    CorePolicy {
        retry: RetryPolicy::no_delay(2),
        ..Default::default()
    }
}

/// Log output visible with RUST_LOG set
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn credential(token: &str, endpoint: &str) -> ContactCredential {
    ContactCredential {
        token: token.to_string(),
        endpoint: endpoint.to_string(),
        display_name: None,
    }
}

#[tokio::test]
async fn pending_contact_appears_in_listing() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;

    engine
        .add_pending_contact(credential("t", "u"), PersonId::new("peer1"), "info")
        .await
        .unwrap();

    let pending = engine.pending_contacts().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].peer, PersonId::new("peer1"));
    assert_eq!(pending[0].credential.token, "t");
}

#[tokio::test]
async fn accept_issues_credential_and_readies_channel() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;
    let bob = PersonId::new("bob");

    let id = engine
        .add_pending_contact(credential("t", "u"), bob.clone(), "info")
        .await
        .unwrap();

    let outcome = engine
        .accept_contact(
            &id,
            AcceptOptions {
                can_message: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Contact moved out of pending
    assert!(engine.pending_contacts().await.is_empty());
    assert_eq!(engine.accepted_contacts().await.len(), 1);

    // A dedicated credential exists for the pair
    assert!(outcome.credential.permissions.can_message);
    assert_eq!(outcome.credential.issuer, PersonId::new("alice"));
    assert_eq!(outcome.credential.subject, bob);

    // The pair channel is ready
    assert!(engine.channel_ready(&bob));

    // The credential was handed to the transport
    assert_eq!(harness.transport.sent_count(PayloadKind::Credential), 1);
    assert_eq!(harness.transport.sent()[0].to, bob);
}

#[tokio::test]
async fn reject_removes_pending_without_credential() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;
    let bob = PersonId::new("bob");

    let id = engine
        .add_pending_contact(credential("t", "u"), bob.clone(), "info")
        .await
        .unwrap();

    engine.reject_contact(&id, "spam").await.unwrap();

    assert!(engine.pending_contacts().await.is_empty());
    assert!(engine.accepted_contacts().await.is_empty());
    assert!(!engine.channel_ready(&bob));
    assert_eq!(harness.transport.sent_count(PayloadKind::Rejection), 1);
}

#[tokio::test]
async fn credential_missing_endpoint_is_rejected() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;

    let result = engine
        .add_pending_contact(credential("token", ""), PersonId::new("bob"), "info")
        .await;

    assert!(matches!(result, Err(CommError::Validation(_))));
    assert!(engine.pending_contacts().await.is_empty());
}

#[tokio::test]
async fn accept_unknown_pending_id_fails() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());

    let result = harness
        .engine
        .accept_contact(&PendingId::new(), AcceptOptions::default())
        .await;
    assert!(matches!(result, Err(CommError::NotFound(_))));
}

#[tokio::test]
async fn mutual_acceptance_across_two_peers() {
    // Both peers share one store, as both sides of a real pairing do
    let store = Arc::new(MemoryStore::new());
    let alice_side = CommEngine::over_store(PersonId::new("alice"), store.clone(), policy());
    let bob_side = CommEngine::over_store(PersonId::new("bob"), store, policy());
    let alice = PersonId::new("alice");
    let bob = PersonId::new("bob");

    // Each side receives the other's contact credential
    let to_alice = alice_side
        .engine
        .add_pending_contact(credential("bob-token", "bob-endpoint"), bob.clone(), "info")
        .await
        .unwrap();
    let to_bob = bob_side
        .engine
        .add_pending_contact(
            credential("alice-token", "alice-endpoint"),
            alice.clone(),
            "info",
        )
        .await
        .unwrap();

    // Both accept independently
    let alice_outcome = alice_side
        .engine
        .accept_contact(&to_alice, AcceptOptions::default())
        .await
        .unwrap();
    let bob_outcome = bob_side
        .engine
        .accept_contact(&to_bob, AcceptOptions::default())
        .await
        .unwrap();

    // Both sides ended up on the same channel object
    assert_eq!(alice_outcome.channel, bob_outcome.channel);

    // Relay each side's issued credential to the other
    assert!(!alice_side.engine.is_mutually_accepted(&bob).await);
    let mutual_for_alice = alice_side
        .engine
        .handle_received_credential(bob_outcome.credential)
        .await
        .unwrap();
    assert!(mutual_for_alice);
    assert!(alice_side.engine.is_mutually_accepted(&bob).await);

    let mutual_for_bob = bob_side
        .engine
        .handle_received_credential(alice_outcome.credential)
        .await
        .unwrap();
    assert!(mutual_for_bob);
}

#[tokio::test]
async fn revoke_marks_credential_but_keeps_contact() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;
    let bob = PersonId::new("bob");

    let id = engine
        .add_pending_contact(credential("t", "u"), bob.clone(), "info")
        .await
        .unwrap();
    engine
        .accept_contact(&id, AcceptOptions::default())
        .await
        .unwrap();

    engine.revoke_credential(&bob).await.unwrap();

    // Contact record and channel survive revocation
    assert_eq!(engine.accepted_contacts().await.len(), 1);
    assert!(engine.channel_ready(&bob));
}

#[tokio::test]
async fn accept_with_failing_transport_reports_warning() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    harness.transport.fail_on(PayloadKind::Credential);
    let engine = &harness.engine;
    let bob = PersonId::new("bob");

    let id = engine
        .add_pending_contact(credential("t", "u"), bob.clone(), "info")
        .await
        .unwrap();
    let outcome = engine
        .accept_contact(&id, AcceptOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.warnings.len(), 1);
    // Acceptance committed despite the delivery failure
    assert_eq!(engine.accepted_contacts().await.len(), 1);
    assert!(engine.channel_ready(&bob));
}

#[tokio::test]
async fn trust_levels_map_to_permissions() {
    let harness = CommEngine::in_memory(PersonId::new("alice"), policy());
    let engine = &harness.engine;

    let low = PersonId::new("low");
    let mid = PersonId::new("mid");
    let high = PersonId::new("high");
    harness.trust.set_level(low.clone(), 0.1);
    harness.trust.set_level(mid.clone(), 0.5);
    harness.trust.set_level(high.clone(), 0.8);

    let p = engine
        .communication_permissions(&low)
        .await
        .permissions()
        .unwrap();
    assert!(!p.can_message);
    assert!(!p.can_sync);

    let p = engine
        .communication_permissions(&mid)
        .await
        .permissions()
        .unwrap();
    assert!(p.can_message);
    assert!(!p.can_sync);

    let p = engine
        .communication_permissions(&high)
        .await
        .permissions()
        .unwrap();
    assert!(p.can_message);
    assert!(p.can_sync);
}
