//! Port interfaces to external collaborators
//!
//! Everything Commlink consumes from the outside world goes through one
//! of these traits: the content-addressed object store, the
//! access-control layer, the channel directory, the trust evaluator, and
//! the peer transport. Concrete adapters are wired at the process
//! boundary; [`crate::memory`] provides in-memory adapters for tests and
//! embedding.

use async_trait::async_trait;

use crate::error::CommResult;
use crate::types::{
    CapabilityGrant, ChannelIdentity, ChannelInfo, IdHash, ObjectHash, PersonId, StoreReceipt,
};

/// Content-addressed object store.
///
/// Append-only from this core's perspective; safe for concurrent
/// additive writes from both peers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a versioned object, returning its version hash and stable
    /// identity hash
    async fn store_versioned(&self, bytes: &[u8]) -> CommResult<StoreReceipt>;

    /// Store an unversioned object, returning its content hash
    async fn store_unversioned(&self, bytes: &[u8]) -> CommResult<ObjectHash>;

    /// Fetch the current version of an object by identity hash
    async fn get_by_id_hash(&self, id: &IdHash) -> CommResult<Vec<u8>>;

    /// Fetch an exact object version by content hash
    async fn get_by_hash(&self, hash: &ObjectHash) -> CommResult<Vec<u8>>;
}

/// Access-control layer recording additive capability grants.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Append an ADD-mode grant record.
    ///
    /// Implementations report an equivalent already-recorded grant as
    /// [`crate::CommError::Conflict`]; callers treat that as success
    /// since grants are cumulative and re-issuing one is harmless. Any
    /// other error is fatal and propagated.
    async fn grant_access(&self, grant: &CapabilityGrant) -> CommResult<()>;
}

/// Directory of communication channels.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Create a channel with the given identity.
    ///
    /// Fails with [`crate::CommError::Conflict`] if a channel with the
    /// same identity already exists; both peers of a pairing may race to
    /// create the same canonical channel, and the loser recovers by
    /// joining.
    async fn create_channel(&self, identity: &ChannelIdentity) -> CommResult<ChannelInfo>;

    /// Look up a channel by identity
    async fn find_channel(&self, identity: &ChannelIdentity) -> CommResult<Option<ChannelInfo>>;
}

/// Action category a trust evaluation is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustAction {
    /// Messaging and content sync with a contact
    Communication,
}

/// Result of an external trust evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustEvaluation {
    /// Trust level in [0, 1]
    pub level: f64,
}

/// Coarse trust status of a person
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// No trust information exists for this person
    Unknown,
    /// Person is trusted
    Trusted,
    /// Person is explicitly untrusted
    Untrusted,
    /// Trust decision pending
    Pending,
    /// Previously granted trust has been revoked
    Revoked,
}

/// Opaque external trust evaluator.
///
/// The scoring formula is out of scope; this core only consumes levels.
#[async_trait]
pub trait TrustEvaluator: Send + Sync {
    /// Evaluate trust in a person for an action category
    async fn evaluate(&self, person: &PersonId, action: TrustAction)
        -> CommResult<TrustEvaluation>;

    /// Coarse trust status for a person
    async fn status(&self, person: &PersonId) -> CommResult<TrustStatus>;
}

/// Kind of payload handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// A dedicated credential issued on acceptance
    Credential,
    /// Notification that a pending contact was rejected
    Rejection,
    /// One-time greeting after a channel becomes ready
    Welcome,
}

/// Wire delivery to a peer. Delivery semantics and retries belong to the
/// transport layer, not this core.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a payload to a peer
    async fn send_to_peer(
        &self,
        peer: &PersonId,
        payload: &[u8],
        kind: PayloadKind,
    ) -> CommResult<()>;
}
