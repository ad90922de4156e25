//! Engine facade
//!
//! [`CommEngine`] wires the coordinators over a set of injected ports
//! and exposes the operations platform shells consume: the pending
//! contact lifecycle, channel establishment, and trust-gated
//! permission checks. All configuration arrives as explicit
//! [`CorePolicy`] values.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::channel::ChannelEstablisher;
use crate::config::CorePolicy;
use crate::contacts::{
    AcceptOptions, AcceptOutcome, AcceptedContact, ContactCoordinator, ContactCredential,
    DedicatedCredential, PendingContact,
};
use crate::error::CommResult;
use crate::events::{ChannelEvent, ContactEvent};
use crate::grants::AccessCoordinator;
use crate::memory::{MemoryStore, MemoryTransport, ScriptedTrust};
use crate::ports::{
    AccessControl, ChannelDirectory, ObjectStore, PeerTransport, TrustEvaluator, TrustStatus,
};
use crate::trust::TrustGate;
use crate::types::{
    ChannelIdentity, ChannelInfo, PendingId, PermissionDecision, PersonId, StoreReceipt,
};

/// External collaborators handed to the engine at construction
pub struct Ports {
    /// Content-addressed object store
    pub store: Arc<dyn ObjectStore>,
    /// Access-control layer
    pub access: Arc<dyn AccessControl>,
    /// Channel directory
    pub directory: Arc<dyn ChannelDirectory>,
    /// Trust evaluator
    pub trust: Arc<dyn TrustEvaluator>,
    /// Peer transport
    pub transport: Arc<dyn PeerTransport>,
}

/// One contact with its permission decision, from
/// [`CommEngine::contacts_with_permissions`]
#[derive(Debug, Clone)]
pub struct ContactPermissionEntry {
    /// The accepted contact
    pub contact: AcceptedContact,
    /// Permission decision for this contact
    pub decision: PermissionDecision,
}

/// Partial-result listing of contacts and their permissions
#[derive(Debug, Clone, Default)]
pub struct ContactListing {
    /// Contacts whose evaluation completed within budget
    pub entries: Vec<ContactPermissionEntry>,
    /// Contacts skipped because their evaluation exceeded the per-item
    /// budget
    pub skipped: Vec<PersonId>,
}

/// Facade over the contact, channel, and trust subsystems for one local
/// person
pub struct CommEngine {
    local: PersonId,
    access: Arc<AccessCoordinator>,
    establisher: Arc<ChannelEstablisher>,
    contacts: Arc<ContactCoordinator>,
    gate: TrustGate,
    trust: Arc<dyn TrustEvaluator>,
    policy: CorePolicy,
}

impl CommEngine {
    /// Create an engine over the given ports and policy
    pub fn new(local: PersonId, ports: Ports, policy: CorePolicy) -> Self {
        let (channel_tx, _) = broadcast::channel(256);
        let (contact_tx, _) = broadcast::channel(256);

        let access = Arc::new(AccessCoordinator::new(ports.access));
        let establisher = Arc::new(ChannelEstablisher::new(
            ports.directory,
            ports.store,
            access.clone(),
            ports.transport.clone(),
            policy.retry,
            channel_tx,
        ));
        let contacts = Arc::new(ContactCoordinator::new(
            local.clone(),
            ports.transport,
            establisher.clone(),
            policy.defaults,
            contact_tx,
        ));
        let gate = TrustGate::new(ports.trust.clone(), policy.thresholds);

        Self {
            local,
            access,
            establisher,
            contacts,
            gate,
            trust: ports.trust,
            policy,
        }
    }

    /// The local person this engine acts for
    pub fn local_person(&self) -> &PersonId {
        &self.local
    }

    /// The access coordinator, for group-channel membership changes
    pub fn access(&self) -> &AccessCoordinator {
        &self.access
    }

    /// Subscribe to contact lifecycle events
    pub fn subscribe_contact_events(&self) -> broadcast::Receiver<ContactEvent> {
        self.contacts.subscribe_events()
    }

    /// Subscribe to channel establishment events
    pub fn subscribe_channel_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.establisher.subscribe_events()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Pending contact lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Record an inbound credential as a pending contact
    pub async fn add_pending_contact(
        &self,
        credential: ContactCredential,
        peer: PersonId,
        connection_info: impl Into<String>,
    ) -> CommResult<PendingId> {
        self.contacts
            .add_pending_contact(credential, peer, connection_info)
            .await
    }

    /// All pending contacts, oldest first
    pub async fn pending_contacts(&self) -> Vec<PendingContact> {
        self.contacts.pending_contacts().await
    }

    /// Look up one pending contact
    pub async fn pending_contact(&self, id: &PendingId) -> Option<PendingContact> {
        self.contacts.pending_contact(id).await
    }

    /// Accept a pending contact; issues a credential and establishes the
    /// pair channel
    pub async fn accept_contact(
        &self,
        id: &PendingId,
        options: AcceptOptions,
    ) -> CommResult<AcceptOutcome> {
        self.contacts.accept_contact(id, options).await
    }

    /// Reject a pending contact
    pub async fn reject_contact(
        &self,
        id: &PendingId,
        reason: impl Into<String>,
    ) -> CommResult<()> {
        self.contacts.reject_contact(id, reason).await
    }

    /// Record a credential a peer issued to us; returns whether the pair
    /// is now mutually accepted
    pub async fn handle_received_credential(
        &self,
        credential: DedicatedCredential,
    ) -> CommResult<bool> {
        self.contacts.handle_received_credential(credential).await
    }

    /// Revoke the credential we issued to a peer
    pub async fn revoke_credential(&self, peer: &PersonId) -> CommResult<()> {
        self.contacts.revoke_credential(peer).await
    }

    /// All accepted contacts
    pub async fn accepted_contacts(&self) -> Vec<AcceptedContact> {
        self.contacts.accepted_contacts().await
    }

    /// Whether credentials exist in both directions for a peer
    pub async fn is_mutually_accepted(&self, peer: &PersonId) -> bool {
        self.contacts.is_mutually_accepted(peer).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Channels
    // ═══════════════════════════════════════════════════════════════════

    /// Establish the pair channel between the local person and a remote
    /// peer
    pub async fn establish_channel(&self, remote: &PersonId) -> CommResult<ChannelInfo> {
        self.establisher.establish(&self.local, remote).await
    }

    /// Whether the pair channel with a peer is ready on this side
    pub fn channel_ready(&self, remote: &PersonId) -> bool {
        self.establisher.is_ready(&self.local, remote)
    }

    /// Handle a payload arriving on a channel that may not be ready yet
    pub async fn handle_incoming(
        &self,
        identity: &ChannelIdentity,
        payload: &[u8],
    ) -> CommResult<(ChannelInfo, StoreReceipt)> {
        self.establisher.ensure_for_incoming(identity, payload).await
    }

    // ═══════════════════════════════════════════════════════════════════
    // Trust
    // ═══════════════════════════════════════════════════════════════════

    /// Communication permissions for a person, or `Unknown` when the
    /// evaluator is unreachable
    pub async fn communication_permissions(&self, person: &PersonId) -> PermissionDecision {
        self.gate.communication_permissions(person).await
    }

    /// Coarse trust status for a person
    pub async fn trust_status(&self, person: &PersonId) -> CommResult<TrustStatus> {
        self.trust.status(person).await
    }

    /// All accepted contacts with their permission decisions.
    ///
    /// Each evaluation is bounded by the configured per-item budget; an
    /// item that exceeds it is skipped and reported, so one slow or
    /// corrupt entry never aborts the listing.
    pub async fn contacts_with_permissions(&self) -> ContactListing {
        let contacts = self.contacts.accepted_contacts().await;
        let mut listing = ContactListing::default();

        for contact in contacts {
            let evaluation = tokio::time::timeout(
                self.policy.item_budget.0,
                self.gate.communication_permissions(&contact.peer),
            )
            .await;
            match evaluation {
                Ok(decision) => listing.entries.push(ContactPermissionEntry {
                    contact,
                    decision,
                }),
                Err(_) => {
                    warn!(peer = %contact.peer, "Permission evaluation exceeded budget, skipping");
                    listing.skipped.push(contact.peer.clone());
                }
            }
        }

        listing
    }
}

/// A self-contained engine over in-memory adapters, for tests and
/// embedding. Several harnesses may share one [`MemoryStore`] to model
/// two peers against the same store.
pub struct EngineHarness {
    /// The wired engine
    pub engine: CommEngine,
    /// The shared in-memory store/directory/access layer
    pub store: Arc<MemoryStore>,
    /// The recording transport
    pub transport: Arc<MemoryTransport>,
    /// The scriptable trust evaluator
    pub trust: Arc<ScriptedTrust>,
}

impl CommEngine {
    /// Build an engine over fresh in-memory adapters
    pub fn in_memory(local: PersonId, policy: CorePolicy) -> EngineHarness {
        Self::over_store(local, Arc::new(MemoryStore::new()), policy)
    }

    /// Build an engine over a shared in-memory store
    pub fn over_store(
        local: PersonId,
        store: Arc<MemoryStore>,
        policy: CorePolicy,
    ) -> EngineHarness {
        let transport = Arc::new(MemoryTransport::new());
        let trust = Arc::new(ScriptedTrust::new());
        let engine = CommEngine::new(
            local,
            Ports {
                store: store.clone(),
                access: store.clone(),
                directory: store.clone(),
                trust: trust.clone(),
                transport: transport.clone(),
            },
            policy,
        );
        EngineHarness {
            engine,
            store,
            transport,
            trust,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ItemBudget, RetryPolicy};
    use crate::ports::{TrustAction, TrustEvaluation};
    use async_trait::async_trait;
    use std::time::Duration;

    fn test_policy() -> CorePolicy {
        CorePolicy {
            retry: RetryPolicy::no_delay(2),
            ..Default::default()
        }
    }

    fn test_credential() -> ContactCredential {
        ContactCredential {
            token: "token".to_string(),
            endpoint: "endpoint".to_string(),
            display_name: Some("Bob".to_string()),
        }
    }

    #[tokio::test]
    async fn test_engine_accept_flow() {
        let harness = CommEngine::in_memory(PersonId::new("alice"), test_policy());
        let engine = &harness.engine;
        let bob = PersonId::new("bob");

        let id = engine
            .add_pending_contact(test_credential(), bob.clone(), "conn")
            .await
            .unwrap();
        let outcome = engine
            .accept_contact(&id, AcceptOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.peer, bob);
        assert!(engine.channel_ready(&bob));
        assert!(engine.pending_contacts().await.is_empty());
        assert_eq!(engine.accepted_contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_engine_permission_listing() {
        let harness = CommEngine::in_memory(PersonId::new("alice"), test_policy());
        let engine = &harness.engine;
        let bob = PersonId::new("bob");
        harness.trust.set_level(bob.clone(), 0.5);

        let id = engine
            .add_pending_contact(test_credential(), bob.clone(), "conn")
            .await
            .unwrap();
        engine
            .accept_contact(&id, AcceptOptions::default())
            .await
            .unwrap();

        let listing = engine.contacts_with_permissions().await;
        assert_eq!(listing.entries.len(), 1);
        assert!(listing.skipped.is_empty());
        let permissions = listing.entries[0].decision.permissions().unwrap();
        assert!(permissions.can_message);
        assert!(!permissions.can_sync);
    }

    /// Evaluator that never answers, to exercise the per-item budget
    struct StalledTrust;

    #[async_trait]
    impl TrustEvaluator for StalledTrust {
        async fn evaluate(
            &self,
            _person: &PersonId,
            _action: TrustAction,
        ) -> CommResult<TrustEvaluation> {
            futures::future::pending().await
        }

        async fn status(&self, _person: &PersonId) -> CommResult<TrustStatus> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_evaluation_skips_item() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let policy = CorePolicy {
            retry: RetryPolicy::no_delay(2),
            item_budget: ItemBudget(Duration::from_millis(10)),
            ..Default::default()
        };
        let engine = CommEngine::new(
            PersonId::new("alice"),
            Ports {
                store: store.clone(),
                access: store.clone(),
                directory: store,
                trust: Arc::new(StalledTrust),
                transport,
            },
            policy,
        );

        let bob = PersonId::new("bob");
        let id = engine
            .add_pending_contact(test_credential(), bob.clone(), "conn")
            .await
            .unwrap();
        engine
            .accept_contact(&id, AcceptOptions::default())
            .await
            .unwrap();

        // The stalled item is skipped, not fatal
        let listing = engine.contacts_with_permissions().await;
        assert!(listing.entries.is_empty());
        assert_eq!(listing.skipped, vec![bob]);
    }

    #[tokio::test]
    async fn test_engine_trust_status_passthrough() {
        let harness = CommEngine::in_memory(PersonId::new("alice"), test_policy());
        let bob = PersonId::new("bob");
        harness.trust.set_status(bob.clone(), TrustStatus::Trusted);

        assert_eq!(
            harness.engine.trust_status(&bob).await.unwrap(),
            TrustStatus::Trusted
        );
        assert_eq!(
            harness
                .engine
                .trust_status(&PersonId::new("stranger"))
                .await
                .unwrap(),
            TrustStatus::Unknown
        );
    }
}
