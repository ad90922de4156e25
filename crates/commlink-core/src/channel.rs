//! P2P channel establishment
//!
//! Runs the idempotent create-or-join protocol for the shared channel
//! between two persons. Per canonical channel key the flow is:
//!
//! ```text
//! absent ──join──────────────────────────────▶ ready
//!   │
//!   └─create──▶ creating ──created──▶ ready
//!                  │
//!                  └─conflicted──(delay, rejoin)──▶ ready | failed
//! ```
//!
//! Both peers of a pairing may run this independently; the canonical
//! pair key makes the outcome order-independent. Joining an existing
//! channel is the common case when the remote peer created it first.
//! When creation loses the race, the loser recovers by rejoining after a
//! fixed delay, bounded by the injected [`RetryPolicy`]. Only exhausted
//! retries are fatal.
//!
//! The bilateral grant is issued immediately after creation, before any
//! data write, so neither participant can ever see a channel containing
//! an entry they cannot read.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{CommError, CommResult};
use crate::events::ChannelEvent;
use crate::grants::AccessCoordinator;
use crate::ports::{ChannelDirectory, ObjectStore, PayloadKind, PeerTransport};
use crate::types::{ChannelIdentity, ChannelInfo, PersonId, StoreReceipt};

/// One-time greeting sent by the pairing initiator once the channel is
/// ready
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelWelcome {
    /// Canonical channel key the greeting belongs to
    pub channel_id: String,
    /// Greeting sender
    pub from: PersonId,
    /// Unix timestamp of the greeting
    pub sent_at: i64,
}

/// Ephemeral per-key coordination state. Never persisted; only decides
/// welcome behavior and attempt accounting on this side.
#[derive(Debug, Default, Clone)]
struct CreationAttempt {
    initiated_here: bool,
    welcome_sent: bool,
}

/// Establishes ready pair channels through the create-or-join protocol
pub struct ChannelEstablisher {
    directory: Arc<dyn ChannelDirectory>,
    store: Arc<dyn ObjectStore>,
    access: Arc<AccessCoordinator>,
    transport: Arc<dyn PeerTransport>,
    retry: RetryPolicy,
    attempts: Mutex<HashMap<String, CreationAttempt>>,
    ready: Mutex<HashMap<String, ChannelInfo>>,
    event_tx: broadcast::Sender<ChannelEvent>,
}

impl ChannelEstablisher {
    /// Create an establisher over the given ports
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        store: Arc<dyn ObjectStore>,
        access: Arc<AccessCoordinator>,
        transport: Arc<dyn PeerTransport>,
        retry: RetryPolicy,
        event_tx: broadcast::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            directory,
            store,
            access,
            transport,
            retry,
            attempts: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to channel events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the channel between the two persons is ready on this side
    pub fn is_ready(&self, a: &PersonId, b: &PersonId) -> bool {
        let identity = ChannelIdentity::between(a, b);
        self.ready.lock().contains_key(&identity.id)
    }

    /// Establish the shared channel between two persons.
    ///
    /// Idempotent under concurrent calls from both sides: exactly one
    /// channel object and one bilateral grant result, whichever side's
    /// creation lands first.
    pub async fn establish(
        &self,
        local: &PersonId,
        remote: &PersonId,
    ) -> CommResult<ChannelInfo> {
        self.establish_inner(local, remote, false).await
    }

    /// Establish as the side that initiated the pairing handshake.
    ///
    /// Identical protocol, plus a one-time welcome payload to the remote
    /// peer after `ready`. Only the initiator greets, so the two sides
    /// never produce duplicate greetings.
    pub async fn establish_initiated(
        &self,
        local: &PersonId,
        remote: &PersonId,
    ) -> CommResult<ChannelInfo> {
        self.establish_inner(local, remote, true).await
    }

    async fn establish_inner(
        &self,
        local: &PersonId,
        remote: &PersonId,
        initiator: bool,
    ) -> CommResult<ChannelInfo> {
        let identity = ChannelIdentity::between(local, remote);

        if initiator {
            self.attempts
                .lock()
                .entry(identity.id.clone())
                .or_default()
                .initiated_here = true;
        }

        // Already ready on this side
        if let Some(info) = self.ready.lock().get(&identity.id).cloned() {
            self.maybe_send_welcome(&identity, local, remote).await;
            return Ok(info);
        }

        // Join an existing channel; the common case when the remote
        // peer created it first
        if let Some(info) = self.directory.find_channel(&identity).await? {
            debug!(channel = %identity, "Joined existing channel");
            return self.finish_ready(identity, info, local, remote).await;
        }

        let mut attempt = 0u32;
        loop {
            match self.directory.create_channel(&identity).await {
                Ok(info) => {
                    // Grant before any data write lands in the channel
                    self.access
                        .grant_bilateral(info.root, local, remote)
                        .await?;

                    info!(channel = %identity, "Created channel and issued bilateral grant");
                    let _ = self.event_tx.send(ChannelEvent::Created {
                        channel: identity.clone(),
                    });
                    return self.finish_ready(identity, info, local, remote).await;
                }
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    debug!(
                        channel = %identity,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "Creation raced with remote peer, rejoining"
                    );
                    let _ = self.event_tx.send(ChannelEvent::CreationConflict {
                        channel: identity.clone(),
                        attempt,
                    });

                    if attempt > self.retry.max_attempts {
                        warn!(
                            channel = %identity,
                            attempts = attempt,
                            "Channel neither creatable nor joinable, giving up"
                        );
                        return Err(CommError::Conflict(format!(
                            "channel {} not joinable after {} attempts",
                            identity, attempt
                        )));
                    }

                    if !self.retry.delay.is_zero() {
                        tokio::time::sleep(self.retry.delay).await;
                    }

                    if let Some(info) = self.directory.find_channel(&identity).await? {
                        debug!(channel = %identity, "Joined channel created by remote peer");
                        return self.finish_ready(identity, info, local, remote).await;
                    }
                    // Still absent; fall through and try creating again
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle data arriving for a channel that is not yet ready locally.
    ///
    /// The remote peer may create the channel and send into it before
    /// our own creation attempt lands. Runs the establish protocol for
    /// the pair derived from the canonical key, then writes the payload
    /// as a channel entry.
    pub async fn ensure_for_incoming(
        &self,
        identity: &ChannelIdentity,
        payload: &[u8],
    ) -> CommResult<(ChannelInfo, StoreReceipt)> {
        let (a, b) = identity.pair_members().ok_or_else(|| {
            CommError::Validation(format!(
                "channel {} is not a canonical pair channel",
                identity
            ))
        })?;

        let info = self.establish(&a, &b).await?;
        let receipt = self.store.store_versioned(payload).await?;

        debug!(
            channel = %identity,
            entry = %receipt.id_hash,
            "Delivered incoming payload after on-demand establishment"
        );
        Ok((info, receipt))
    }

    async fn finish_ready(
        &self,
        identity: ChannelIdentity,
        info: ChannelInfo,
        local: &PersonId,
        remote: &PersonId,
    ) -> CommResult<ChannelInfo> {
        self.ready
            .lock()
            .insert(identity.id.clone(), info.clone());

        info!(channel = %identity, "Channel ready");
        let _ = self.event_tx.send(ChannelEvent::Ready {
            channel: identity.clone(),
        });

        self.maybe_send_welcome(&identity, local, remote).await;
        Ok(info)
    }

    /// Send the one-time greeting if this side initiated the pairing and
    /// has not greeted yet. Send failure is non-fatal; the channel is
    /// already ready.
    async fn maybe_send_welcome(
        &self,
        identity: &ChannelIdentity,
        local: &PersonId,
        remote: &PersonId,
    ) {
        let should_send = {
            let attempts = self.attempts.lock();
            attempts
                .get(&identity.id)
                .map(|a| a.initiated_here && !a.welcome_sent)
                .unwrap_or(false)
        };
        if !should_send {
            return;
        }

        let welcome = ChannelWelcome {
            channel_id: identity.id.clone(),
            from: local.clone(),
            sent_at: chrono::Utc::now().timestamp(),
        };
        let bytes = match postcard::to_allocvec(&welcome) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(channel = %identity, error = %e, "Failed to encode welcome payload");
                return;
            }
        };

        match self
            .transport
            .send_to_peer(remote, &bytes, PayloadKind::Welcome)
            .await
        {
            Ok(()) => {
                if let Some(attempt) = self.attempts.lock().get_mut(&identity.id) {
                    attempt.welcome_sent = true;
                }
                debug!(channel = %identity, to = %remote, "Sent welcome payload");
                let _ = self.event_tx.send(ChannelEvent::WelcomeSent {
                    channel: identity.clone(),
                    to: remote.clone(),
                });
            }
            Err(e) => {
                warn!(
                    channel = %identity,
                    to = %remote,
                    error = %e,
                    "Welcome delivery failed, channel stays ready"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, MemoryTransport};
    use async_trait::async_trait;

    fn establisher(
        store: Arc<MemoryStore>,
        transport: Arc<MemoryTransport>,
        retry: RetryPolicy,
    ) -> ChannelEstablisher {
        let (event_tx, _) = broadcast::channel(64);
        ChannelEstablisher::new(
            store.clone(),
            store.clone(),
            Arc::new(AccessCoordinator::new(store)),
            transport,
            retry,
            event_tx,
        )
    }

    #[tokio::test]
    async fn test_establish_creates_channel_and_grants() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let est = establisher(store.clone(), transport, RetryPolicy::no_delay(2));

        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");
        let info = est.establish(&alice, &bob).await.unwrap();

        assert_eq!(store.channel_count(), 1);
        assert!(store.person_has_access(&alice, &info.root));
        assert!(store.person_has_access(&bob, &info.root));
        assert!(est.is_ready(&alice, &bob));
        assert!(est.is_ready(&bob, &alice));
    }

    #[tokio::test]
    async fn test_establish_joins_existing_channel() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");

        // The remote side created the channel first
        let identity = ChannelIdentity::between(&alice, &bob);
        let created = store.create_channel(&identity).await.unwrap();

        let est = establisher(store.clone(), transport, RetryPolicy::no_delay(2));
        let joined = est.establish(&bob, &alice).await.unwrap();

        assert_eq!(joined, created);
        assert_eq!(store.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_establish_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let est = establisher(store.clone(), transport, RetryPolicy::no_delay(2));

        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");
        let first = est.establish(&alice, &bob).await.unwrap();
        let second = est.establish(&alice, &bob).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.channel_count(), 1);
        assert_eq!(store.person_grant_count(), 2);
    }

    /// Directory that simulates the remote peer creating the channel in
    /// the window between our lookup and our creation attempt.
    struct RacingDirectory {
        inner: Arc<MemoryStore>,
        identity: ChannelIdentity,
        finds: Mutex<u32>,
    }

    #[async_trait]
    impl ChannelDirectory for RacingDirectory {
        async fn create_channel(&self, identity: &ChannelIdentity) -> CommResult<ChannelInfo> {
            // Remote wins every creation race
            let _ = self.inner.create_channel(&self.identity).await;
            Err(CommError::Conflict(format!(
                "channel {} already exists",
                identity
            )))
        }

        async fn find_channel(
            &self,
            identity: &ChannelIdentity,
        ) -> CommResult<Option<ChannelInfo>> {
            let first_lookup = {
                let mut finds = self.finds.lock();
                *finds += 1;
                *finds == 1
            };
            if first_lookup {
                // Not visible yet on the first lookup
                return Ok(None);
            }
            self.inner.find_channel(identity).await
        }
    }

    #[tokio::test]
    async fn test_creation_conflict_recovers_by_joining() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");
        let identity = ChannelIdentity::between(&alice, &bob);

        let directory = Arc::new(RacingDirectory {
            inner: store.clone(),
            identity: identity.clone(),
            finds: Mutex::new(0),
        });
        let (event_tx, mut event_rx) = broadcast::channel(64);
        let est = ChannelEstablisher::new(
            directory,
            store.clone(),
            Arc::new(AccessCoordinator::new(store.clone())),
            transport,
            RetryPolicy::no_delay(2),
            event_tx,
        );

        let info = est.establish(&alice, &bob).await.unwrap();
        assert_eq!(info.identity, identity);
        assert!(est.is_ready(&alice, &bob));

        // Conflict was observed before the join succeeded
        let mut saw_conflict = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, ChannelEvent::CreationConflict { .. }) {
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);
    }

    /// Directory where the channel never becomes creatable or joinable
    struct BlackholeDirectory;

    #[async_trait]
    impl ChannelDirectory for BlackholeDirectory {
        async fn create_channel(&self, identity: &ChannelIdentity) -> CommResult<ChannelInfo> {
            Err(CommError::Conflict(format!(
                "channel {} already exists",
                identity
            )))
        }

        async fn find_channel(
            &self,
            _identity: &ChannelIdentity,
        ) -> CommResult<Option<ChannelInfo>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_conflict() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let (event_tx, _) = broadcast::channel(64);
        let est = ChannelEstablisher::new(
            Arc::new(BlackholeDirectory),
            store.clone(),
            Arc::new(AccessCoordinator::new(store)),
            transport,
            RetryPolicy::no_delay(2),
            event_tx,
        );

        let result = est
            .establish(&PersonId::new("alice"), &PersonId::new("bob"))
            .await;
        assert!(matches!(result, Err(CommError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_only_initiator_sends_welcome_once() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let est = establisher(store.clone(), transport.clone(), RetryPolicy::no_delay(2));

        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");

        est.establish_initiated(&alice, &bob).await.unwrap();
        assert_eq!(transport.sent_count(PayloadKind::Welcome), 1);

        // Re-establishing does not greet again
        est.establish_initiated(&alice, &bob).await.unwrap();
        assert_eq!(transport.sent_count(PayloadKind::Welcome), 1);

        let welcome: ChannelWelcome =
            postcard::from_bytes(&transport.sent()[0].payload).unwrap();
        assert_eq!(welcome.from, alice);
    }

    #[tokio::test]
    async fn test_non_initiator_sends_no_welcome() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let est = establisher(store.clone(), transport.clone(), RetryPolicy::no_delay(2));

        est.establish(&PersonId::new("alice"), &PersonId::new("bob"))
            .await
            .unwrap();
        assert_eq!(transport.sent_count(PayloadKind::Welcome), 0);
    }

    #[tokio::test]
    async fn test_welcome_failure_keeps_channel_ready() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_on(PayloadKind::Welcome);
        let est = establisher(store.clone(), transport.clone(), RetryPolicy::no_delay(2));

        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");
        est.establish_initiated(&alice, &bob).await.unwrap();

        assert!(est.is_ready(&alice, &bob));
        assert_eq!(transport.sent_count(PayloadKind::Welcome), 0);
    }

    #[tokio::test]
    async fn test_ensure_for_incoming_establishes_then_stores() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let alice = PersonId::new("alice");
        let bob = PersonId::new("bob");

        // Remote created the channel and sent data before we ever ran
        // our own establishment
        let identity = ChannelIdentity::between(&alice, &bob);
        store.create_channel(&identity).await.unwrap();

        let est = establisher(store.clone(), transport, RetryPolicy::no_delay(2));
        let (info, receipt) = est
            .ensure_for_incoming(&identity, b"first message")
            .await
            .unwrap();

        assert_eq!(info.identity, identity);
        assert!(est.is_ready(&alice, &bob));
        assert_eq!(
            store.get_by_id_hash(&receipt.id_hash).await.unwrap(),
            b"first message"
        );
    }

    #[tokio::test]
    async fn test_ensure_for_incoming_rejects_owned_channel() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let est = establisher(store.clone(), transport, RetryPolicy::no_delay(2));

        let identity = ChannelIdentity::single("journal", PersonId::new("alice"));
        let result = est.ensure_for_incoming(&identity, b"data").await;
        assert!(matches!(result, Err(CommError::Validation(_))));
    }
}
