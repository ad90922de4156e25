//! Contact acceptance lifecycle
//!
//! Owns the pending → accepted | rejected state machine for inbound
//! contact credentials, issues dedicated per-pair credentials on
//! acceptance, and triggers channel establishment as a downstream
//! effect so messaging is immediately available.
//!
//! ## Protocol flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Contact Acceptance                                             │
//! │                                                                 │
//! │  1. Peer credential arrives → recorded as pending               │
//! │  2. Local decision: accept or reject                            │
//! │  3. Accept → dedicated credential issued + sent to peer         │
//! │            → pair channel established (initiator side)          │
//! │  4. Peer's own credential arrives → pair is mutually accepted   │
//! │  5. Revoke → credential marked revoked, contact record kept     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pending/accepted/credential tables are volatile: they live in
//! memory, are owned exclusively by one coordinator instance per
//! process, and are lost on restart. Each logical state transition
//! (e.g. "move a pending contact to accepted") completes under a single
//! write guard with no suspension point, so interleaved call chains
//! never observe a half-applied transition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::channel::ChannelEstablisher;
use crate::config::PermissionDefaults;
use crate::error::{CommError, CommResult};
use crate::events::ContactEvent;
use crate::ports::{PayloadKind, PeerTransport};
use crate::types::{ChannelInfo, PendingId, PersonId};

/// Seconds after which an undecided pending contact counts as stale
const STALE_PENDING_SECS: i64 = 7 * 24 * 60 * 60;

/// Inbound contact credential, as received from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCredential {
    /// Token/handle identifying the issuing peer
    pub token: String,
    /// Reachable URL or endpoint for the peer
    pub endpoint: String,
    /// Optional display name for preview
    pub display_name: Option<String>,
}

impl ContactCredential {
    /// Check the minimum required fields are present
    pub fn validate(&self) -> CommResult<()> {
        if self.token.trim().is_empty() {
            return Err(CommError::Validation(
                "credential is missing a token".to_string(),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(CommError::Validation(
                "credential is missing an endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

/// A received-but-undecided contact awaiting accept/reject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingContact {
    /// Generated identifier for this pending entry
    pub id: PendingId,
    /// The peer the credential came from
    pub peer: PersonId,
    /// The credential as received
    pub credential: ContactCredential,
    /// Opaque connection info captured at receipt time
    pub connection_info: String,
    /// Unix timestamp of receipt
    pub received_at: i64,
}

impl PendingContact {
    /// Whether this pending contact has waited longer than 7 days
    pub fn is_stale(&self) -> bool {
        chrono::Utc::now().timestamp() - self.received_at > STALE_PENDING_SECS
    }
}

/// Permissions carried by a dedicated credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPermissions {
    /// Peer may send messages
    pub can_message: bool,
    /// Peer may place calls
    pub can_call: bool,
    /// Peer may share files
    pub can_share_files: bool,
    /// Peer may see presence
    pub can_see_presence: bool,
    /// Free-form extension permissions
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl ChannelPermissions {
    /// Permissions filled entirely from the configured baseline
    pub fn from_defaults(defaults: &PermissionDefaults) -> Self {
        Self {
            can_message: defaults.can_message,
            can_call: defaults.can_call,
            can_share_files: defaults.can_share_files,
            can_see_presence: defaults.can_see_presence,
            custom: serde_json::Map::new(),
        }
    }
}

/// Per-field overrides applied on top of the configured baseline when
/// accepting a contact
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Override for `can_message`
    pub can_message: Option<bool>,
    /// Override for `can_call`
    pub can_call: Option<bool>,
    /// Override for `can_share_files`
    pub can_share_files: Option<bool>,
    /// Override for `can_see_presence`
    pub can_see_presence: Option<bool>,
    /// Free-form extension permissions
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl AcceptOptions {
    fn resolve(&self, defaults: &PermissionDefaults) -> ChannelPermissions {
        ChannelPermissions {
            can_message: self.can_message.unwrap_or(defaults.can_message),
            can_call: self.can_call.unwrap_or(defaults.can_call),
            can_share_files: self.can_share_files.unwrap_or(defaults.can_share_files),
            can_see_presence: self.can_see_presence.unwrap_or(defaults.can_see_presence),
            custom: self.custom.clone(),
        }
    }
}

/// Per-pair credential issued on acceptance.
///
/// Created once per accept; may later be revoked, never re-issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedCredential {
    /// Person who issued the credential
    pub issuer: PersonId,
    /// Person the credential is issued to
    pub subject: PersonId,
    /// Granted permissions
    pub permissions: ChannelPermissions,
    /// Unix timestamp of issuance
    pub issued_at: i64,
    /// Whether the credential has been revoked
    pub revoked: bool,
}

/// Notice sent to a peer whose pending contact was rejected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionNotice {
    /// The rejecting person
    pub from: PersonId,
    /// Caller-supplied reason
    pub reason: String,
}

/// An accepted contact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedContact {
    /// The accepted peer
    pub peer: PersonId,
    /// Connection info carried over from the pending entry
    pub connection_info: String,
    /// Unix timestamp of acceptance
    pub accepted_at: i64,
}

/// Result of a successful acceptance
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    /// The accepted peer
    pub peer: PersonId,
    /// The ready pair channel
    pub channel: ChannelInfo,
    /// The issued credential
    pub credential: DedicatedCredential,
    /// Non-fatal problems (e.g. the credential could not be delivered)
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct ContactTables {
    pending: HashMap<PendingId, PendingContact>,
    accepted: HashMap<PersonId, AcceptedContact>,
    issued: HashMap<PersonId, DedicatedCredential>,
    received: HashMap<PersonId, DedicatedCredential>,
}

/// Owns the pending → accepted | rejected state machine
pub struct ContactCoordinator {
    local: PersonId,
    transport: Arc<dyn PeerTransport>,
    establisher: Arc<ChannelEstablisher>,
    defaults: PermissionDefaults,
    tables: RwLock<ContactTables>,
    event_tx: broadcast::Sender<ContactEvent>,
}

impl ContactCoordinator {
    /// Create a coordinator for the given local person
    pub fn new(
        local: PersonId,
        transport: Arc<dyn PeerTransport>,
        establisher: Arc<ChannelEstablisher>,
        defaults: PermissionDefaults,
        event_tx: broadcast::Sender<ContactEvent>,
    ) -> Self {
        Self {
            local,
            transport,
            establisher,
            defaults,
            tables: RwLock::new(ContactTables::default()),
            event_tx,
        }
    }

    /// Subscribe to contact events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ContactEvent> {
        self.event_tx.subscribe()
    }

    /// Record an inbound credential as a pending contact.
    ///
    /// Fails with [`CommError::Validation`] if the credential is missing
    /// its token or endpoint; nothing is recorded in that case.
    pub async fn add_pending_contact(
        &self,
        credential: ContactCredential,
        peer: PersonId,
        connection_info: impl Into<String>,
    ) -> CommResult<PendingId> {
        credential.validate()?;

        let pending = PendingContact {
            id: PendingId::new(),
            peer: peer.clone(),
            credential,
            connection_info: connection_info.into(),
            received_at: chrono::Utc::now().timestamp(),
        };
        let pending_id = pending.id;

        self.tables.write().await.pending.insert(pending_id, pending);

        info!(pending_id = %pending_id, peer = %peer, "Recorded pending contact");
        let _ = self.event_tx.send(ContactEvent::PendingAdded {
            pending_id,
            peer,
        });
        Ok(pending_id)
    }

    /// All pending contacts, oldest first
    pub async fn pending_contacts(&self) -> Vec<PendingContact> {
        let tables = self.tables.read().await;
        let mut pending: Vec<_> = tables.pending.values().cloned().collect();
        pending.sort_by_key(|p| p.id.0);
        pending
    }

    /// Look up one pending contact
    pub async fn pending_contact(&self, id: &PendingId) -> Option<PendingContact> {
        self.tables.read().await.pending.get(id).cloned()
    }

    /// Accept a pending contact.
    ///
    /// Issues a dedicated credential (options layered over the
    /// configured baseline), moves the record out of pending, sends the
    /// credential to the peer, and establishes the pair channel so
    /// messaging is immediately available.
    ///
    /// The local acceptance commits before any I/O. A failed credential
    /// delivery is surfaced as a warning on the outcome, never as an
    /// error, and is not retried here; delivery retries belong to the
    /// transport layer.
    pub async fn accept_contact(
        &self,
        id: &PendingId,
        options: AcceptOptions,
    ) -> CommResult<AcceptOutcome> {
        // The whole pending → accepted transition happens under one
        // write guard so no interleaved flow sees a half-state.
        let (pending, credential) = {
            let mut tables = self.tables.write().await;
            let pending = tables
                .pending
                .remove(id)
                .ok_or_else(|| CommError::NotFound(format!("{}", id)))?;

            let credential = DedicatedCredential {
                issuer: self.local.clone(),
                subject: pending.peer.clone(),
                permissions: options.resolve(&self.defaults),
                issued_at: chrono::Utc::now().timestamp(),
                revoked: false,
            };
            tables
                .issued
                .insert(pending.peer.clone(), credential.clone());
            tables.accepted.insert(
                pending.peer.clone(),
                AcceptedContact {
                    peer: pending.peer.clone(),
                    connection_info: pending.connection_info.clone(),
                    accepted_at: credential.issued_at,
                },
            );
            (pending, credential)
        };

        info!(pending_id = %id, peer = %pending.peer, "Accepted contact, issued dedicated credential");

        let mut warnings = Vec::new();
        match self.send_credential(&pending.peer, &credential).await {
            Ok(()) => {
                debug!(peer = %pending.peer, "Delivered dedicated credential");
            }
            Err(e) => {
                // Acceptance already committed locally; the contact is
                // usable even if the peer has not received our
                // credential yet.
                warn!(peer = %pending.peer, error = %e, "Credential delivery failed");
                warnings.push(format!("credential delivery failed: {}", e));
                let _ = self.event_tx.send(ContactEvent::DeliveryWarning {
                    peer: pending.peer.clone(),
                    detail: e.to_string(),
                });
            }
        }

        // We initiated the pairing decision, so we greet
        let channel = self
            .establisher
            .establish_initiated(&self.local, &pending.peer)
            .await?;

        let _ = self.event_tx.send(ContactEvent::Accepted {
            peer: pending.peer.clone(),
        });

        Ok(AcceptOutcome {
            peer: pending.peer,
            channel,
            credential,
            warnings,
        })
    }

    /// Reject a pending contact.
    ///
    /// Removes the pending record and notifies the peer best-effort;
    /// failure to notify never fails the rejection. No credential is
    /// created.
    pub async fn reject_contact(&self, id: &PendingId, reason: impl Into<String>) -> CommResult<()> {
        let reason = reason.into();
        let pending = self
            .tables
            .write()
            .await
            .pending
            .remove(id)
            .ok_or_else(|| CommError::NotFound(format!("{}", id)))?;

        info!(pending_id = %id, peer = %pending.peer, reason = %reason, "Rejected pending contact");

        let notice = RejectionNotice {
            from: self.local.clone(),
            reason: reason.clone(),
        };
        match postcard::to_allocvec(&notice) {
            Ok(bytes) => {
                if let Err(e) = self
                    .transport
                    .send_to_peer(&pending.peer, &bytes, PayloadKind::Rejection)
                    .await
                {
                    warn!(peer = %pending.peer, error = %e, "Rejection notice delivery failed");
                }
            }
            Err(e) => {
                warn!(peer = %pending.peer, error = %e, "Failed to encode rejection notice");
            }
        }

        let _ = self.event_tx.send(ContactEvent::Rejected {
            pending_id: *id,
            reason,
        });
        Ok(())
    }

    /// Record a dedicated credential issued to us by a peer.
    ///
    /// Returns whether the pair is now mutually accepted: both a
    /// locally-issued and a peer-issued credential exist.
    pub async fn handle_received_credential(
        &self,
        credential: DedicatedCredential,
    ) -> CommResult<bool> {
        if credential.subject != self.local {
            return Err(CommError::Validation(format!(
                "credential subject {} is not this person",
                credential.subject
            )));
        }

        let peer = credential.issuer.clone();
        let mutual = {
            let mut tables = self.tables.write().await;
            tables.received.insert(peer.clone(), credential);
            tables.issued.contains_key(&peer)
        };

        debug!(peer = %peer, mutual, "Recorded peer-issued credential");
        let _ = self.event_tx.send(ContactEvent::CredentialReceived {
            peer: peer.clone(),
        });
        if mutual {
            info!(peer = %peer, "Contact is now mutually accepted");
            let _ = self
                .event_tx
                .send(ContactEvent::MutuallyAccepted { peer });
        }
        Ok(mutual)
    }

    /// Whether credentials exist in both directions for this peer
    pub async fn is_mutually_accepted(&self, peer: &PersonId) -> bool {
        let tables = self.tables.read().await;
        tables.issued.contains_key(peer) && tables.received.contains_key(peer)
    }

    /// Mark the credential we issued to a peer as revoked.
    ///
    /// Credential-only: the contact record is retained and the channel
    /// stays open. There is no re-issue path.
    pub async fn revoke_credential(&self, peer: &PersonId) -> CommResult<()> {
        let mut tables = self.tables.write().await;
        let credential = tables
            .issued
            .get_mut(peer)
            .ok_or_else(|| CommError::NotFound(format!("no credential issued to {}", peer)))?;
        credential.revoked = true;
        drop(tables);

        info!(peer = %peer, "Revoked dedicated credential");
        let _ = self.event_tx.send(ContactEvent::CredentialRevoked {
            peer: peer.clone(),
        });
        Ok(())
    }

    /// The credential we issued to a peer, if any
    pub async fn issued_credential(&self, peer: &PersonId) -> Option<DedicatedCredential> {
        self.tables.read().await.issued.get(peer).cloned()
    }

    /// The credential a peer issued to us, if any
    pub async fn received_credential(&self, peer: &PersonId) -> Option<DedicatedCredential> {
        self.tables.read().await.received.get(peer).cloned()
    }

    /// All accepted contacts
    pub async fn accepted_contacts(&self) -> Vec<AcceptedContact> {
        let tables = self.tables.read().await;
        let mut accepted: Vec<_> = tables.accepted.values().cloned().collect();
        accepted.sort_by(|a, b| a.peer.cmp(&b.peer));
        accepted
    }

    /// Drop pending contacts older than 7 days, returning how many were
    /// removed
    pub async fn prune_stale_pending(&self) -> usize {
        let mut tables = self.tables.write().await;
        let before = tables.pending.len();
        tables.pending.retain(|_, p| !p.is_stale());
        let removed = before - tables.pending.len();
        if removed > 0 {
            info!(removed, "Pruned stale pending contacts");
        }
        removed
    }

    async fn send_credential(
        &self,
        peer: &PersonId,
        credential: &DedicatedCredential,
    ) -> CommResult<()> {
        let bytes = postcard::to_allocvec(credential)
            .map_err(|e| CommError::Serialization(e.to_string()))?;
        self.transport
            .send_to_peer(peer, &bytes, PayloadKind::Credential)
            .await
    }
}
