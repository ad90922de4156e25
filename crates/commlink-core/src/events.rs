//! Event types for shell/UI observers
//!
//! Both coordinators publish onto `tokio::sync::broadcast` channels.
//! Dispatch is decoupled from the writer: a slow observer lags and drops
//! old events instead of blocking state changes, and dropping the
//! receiver is the unsubscribe.

use crate::types::{ChannelIdentity, PendingId, PersonId};

/// Events emitted by the contact acceptance lifecycle
#[derive(Debug, Clone)]
pub enum ContactEvent {
    /// An inbound credential was recorded as a pending contact
    PendingAdded {
        /// Generated pending id
        pending_id: PendingId,
        /// The peer the credential came from
        peer: PersonId,
    },
    /// A pending contact was accepted and a credential issued
    Accepted {
        /// The accepted peer
        peer: PersonId,
    },
    /// A pending contact was rejected
    Rejected {
        /// The rejected pending id
        pending_id: PendingId,
        /// Caller-supplied reason
        reason: String,
    },
    /// The peer's own credential for this pair arrived
    CredentialReceived {
        /// The issuing peer
        peer: PersonId,
    },
    /// Both a locally-issued and a peer-issued credential now exist
    MutuallyAccepted {
        /// The mutually accepted peer
        peer: PersonId,
    },
    /// A locally-issued credential was revoked
    CredentialRevoked {
        /// The peer whose credential was revoked
        peer: PersonId,
    },
    /// A local state change committed but peer delivery failed
    DeliveryWarning {
        /// The unreachable peer
        peer: PersonId,
        /// What failed
        detail: String,
    },
}

/// Events emitted during channel establishment
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// This process created the channel object
    Created {
        /// The created channel
        channel: ChannelIdentity,
    },
    /// Creation raced with the remote peer; rejoining
    CreationConflict {
        /// The contested channel
        channel: ChannelIdentity,
        /// Rejoin attempt number
        attempt: u32,
    },
    /// The channel is ready for use on this side
    Ready {
        /// The ready channel
        channel: ChannelIdentity,
    },
    /// The one-time welcome payload was sent
    WelcomeSent {
        /// The channel greeted on
        channel: ChannelIdentity,
        /// Recipient of the greeting
        to: PersonId,
    },
}

impl ChannelEvent {
    /// The channel this event refers to
    pub fn channel(&self) -> &ChannelIdentity {
        match self {
            ChannelEvent::Created { channel } => channel,
            ChannelEvent::CreationConflict { channel, .. } => channel,
            ChannelEvent::Ready { channel } => channel,
            ChannelEvent::WelcomeSent { channel, .. } => channel,
        }
    }
}
