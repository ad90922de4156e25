//! Commlink Core Library
//!
//! Bilateral P2P channel establishment with capability-gated access.
//!
//! ## Overview
//!
//! Commlink establishes communication channels between two
//! independently-acting peers after identity pairing, grants read
//! capabilities over an append-only content-addressed object graph, and
//! gates communication permissions on an external trust evaluation.
//! Both sides of a pairing may race to perform the same setup; the
//! canonical pair key and the idempotent create-or-join protocol make
//! the outcome order-independent.
//!
//! ## Core Principles
//!
//! - **Race-safe**: concurrent establishment from both peers yields
//!   exactly one channel and one bilateral grant
//! - **No group leakage**: pair channels are granted person-to-person,
//!   never through group membership
//! - **Backfill-complete**: a member joining a multi-party channel can
//!   read everything that existed at join time
//!
//! ## Quick Start
//!
//! ```ignore
//! use commlink_core::{AcceptOptions, CommEngine, CorePolicy, PersonId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let harness = CommEngine::in_memory(PersonId::new("alice"), CorePolicy::default());
//!     let engine = &harness.engine;
//!
//!     // An inbound credential becomes a pending contact
//!     let pending = engine.pending_contacts().await;
//!
//!     // Accepting issues a credential and readies the pair channel
//!     if let Some(contact) = pending.first() {
//!         engine.accept_contact(&contact.id, AcceptOptions::default()).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod contacts;
pub mod engine;
pub mod error;
pub mod events;
pub mod grants;
pub mod memory;
pub mod ports;
pub mod trust;
pub mod types;

// Re-exports
pub use channel::{ChannelEstablisher, ChannelWelcome};
pub use config::{CorePolicy, ItemBudget, PermissionDefaults, RetryPolicy, TrustThresholds};
pub use contacts::{
    AcceptOptions, AcceptOutcome, AcceptedContact, ChannelPermissions, ContactCoordinator,
    ContactCredential, DedicatedCredential, PendingContact, RejectionNotice,
};
pub use engine::{CommEngine, ContactListing, ContactPermissionEntry, EngineHarness, Ports};
pub use error::{CommError, CommResult};
pub use events::{ChannelEvent, ContactEvent};
pub use grants::{AccessCoordinator, GrantBatchReport};
pub use memory::{MemoryStore, MemoryTransport, ScriptedTrust, SentPayload};
pub use ports::{
    AccessControl, ChannelDirectory, ObjectStore, PayloadKind, PeerTransport, TrustAction,
    TrustEvaluation, TrustEvaluator, TrustStatus,
};
pub use trust::TrustGate;
pub use types::*;
