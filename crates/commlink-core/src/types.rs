//! Core types for Commlink
//!
//! Identity values, content addresses, channel identities, and capability
//! grants. The canonical pair key defined here is what makes bilateral
//! channel establishment order-independent: both peers derive the same
//! [`ChannelIdentity`] no matter which side computes it first.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identity of a person (human or automated contact)
///
/// Opaque identifier owned by the external identity layer. Commlink only
/// compares and sorts these; it never derives them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonId(String);

impl PersonId {
    /// Wrap an identity string from the identity layer
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PersonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to a principal group in the access-control layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupRef(String);

impl GroupRef {
    /// Wrap a group identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the group identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group_{}", self.0)
    }
}

/// Content hash of a stored object version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(pub [u8; 32]);

impl ObjectHash {
    /// Compute the content hash of raw object bytes
    pub fn digest(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj_{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Stable identity hash of a versioned object
///
/// Stays the same across versions of the same logical object; this is
/// the unit capability grants target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdHash(pub [u8; 32]);

impl IdHash {
    /// Derive an identity hash from a stable identity string
    pub fn derive(id: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"commlink-id");
        hasher.update(id.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for IdHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id_{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Receipt returned when a versioned object is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreReceipt {
    /// Hash of this specific version
    pub hash: ObjectHash,
    /// Stable identity hash across versions
    pub id_hash: IdHash,
}

/// Separator joining the two sorted members of a canonical pair key
pub const PAIR_SEPARATOR: &str = "<->";

/// Identity of a communication channel
///
/// Either single-owner (keyed by id + owner) or a shared two-party
/// channel keyed by the canonical pair key with no owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
    /// Channel key. For pair channels this is the canonical pair key.
    pub id: String,
    /// Owner for single-owner channels; `None` for shared pair channels
    pub owner: Option<PersonId>,
}

impl ChannelIdentity {
    /// Canonical identity of the shared channel between two persons.
    ///
    /// Commutative: `between(a, b) == between(b, a)`, so both peers
    /// independently compute the same identity.
    pub fn between(a: &PersonId, b: &PersonId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            id: format!("{}{}{}", lo.as_str(), PAIR_SEPARATOR, hi.as_str()),
            owner: None,
        }
    }

    /// Identity of a single-owner channel
    pub fn single(id: impl Into<String>, owner: PersonId) -> Self {
        Self {
            id: id.into(),
            owner: Some(owner),
        }
    }

    /// Whether this is a shared two-party channel
    pub fn is_pair(&self) -> bool {
        self.owner.is_none() && self.id.contains(PAIR_SEPARATOR)
    }

    /// The two members of a pair channel, in canonical order
    pub fn pair_members(&self) -> Option<(PersonId, PersonId)> {
        if self.owner.is_some() {
            return None;
        }
        let (lo, hi) = self.id.split_once(PAIR_SEPARATOR)?;
        if lo.is_empty() || hi.is_empty() {
            return None;
        }
        Some((PersonId::new(lo), PersonId::new(hi)))
    }

    /// Stable identity hash for this channel's root object
    pub fn root_id_hash(&self) -> IdHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"commlink-channel");
        hasher.update(self.id.as_bytes());
        if let Some(owner) = &self.owner {
            hasher.update(owner.as_str().as_bytes());
        }
        IdHash(*hasher.finalize().as_bytes())
    }

    /// Deterministic 32-byte topic for transports that address channels
    /// by fixed-size key
    pub fn topic(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"commlink-topic");
        hasher.update(self.id.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl std::fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "channel_{}@{}", self.id, owner),
            None => write!(f, "channel_{}", self.id),
        }
    }
}

/// Channel record held by the channel directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel identity
    pub identity: ChannelIdentity,
    /// Identity hash of the channel root object
    pub root: IdHash,
    /// Unix timestamp of creation
    pub created_at: i64,
}

/// Mode of a capability grant. Grants are additive only; no removal
/// operation exists in this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantMode {
    /// Add access for the named principals/groups
    Add,
}

/// An additive access record over a stored object
///
/// Grants one or more persons (and/or groups) read access to the target
/// object. For pair channels the group set must always be empty; use
/// [`CapabilityGrant::bilateral`], which enforces this by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    /// The object access is granted over
    pub target: IdHash,
    /// Persons receiving access
    pub persons: BTreeSet<PersonId>,
    /// Groups receiving access. Empty for bilateral channel grants.
    pub groups: BTreeSet<GroupRef>,
    /// Always additive
    pub mode: GrantMode,
}

impl CapabilityGrant {
    /// Grant naming exactly two persons and no groups.
    ///
    /// Access to a pair channel must never be reachable via group
    /// membership, only via direct person-to-person grants.
    pub fn bilateral(target: IdHash, a: PersonId, b: PersonId) -> Self {
        let mut persons = BTreeSet::new();
        persons.insert(a);
        persons.insert(b);
        Self {
            target,
            persons,
            groups: BTreeSet::new(),
            mode: GrantMode::Add,
        }
    }

    /// Grant for a single person and no groups
    pub fn for_person(target: IdHash, person: PersonId) -> Self {
        let mut persons = BTreeSet::new();
        persons.insert(person);
        Self {
            target,
            persons,
            groups: BTreeSet::new(),
            mode: GrantMode::Add,
        }
    }

    /// Grant for persons and groups
    pub fn new(
        target: IdHash,
        persons: impl IntoIterator<Item = PersonId>,
        groups: impl IntoIterator<Item = GroupRef>,
    ) -> Self {
        Self {
            target,
            persons: persons.into_iter().collect(),
            groups: groups.into_iter().collect(),
            mode: GrantMode::Add,
        }
    }

    /// A grant must name at least one person or group
    pub fn is_valid(&self) -> bool {
        !self.persons.is_empty() || !self.groups.is_empty()
    }
}

/// Unique identifier for a pending contact request
///
/// Uses ULID for time-ordered identifiers that sort lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingId(pub Ulid);

impl PendingId {
    /// Create a new PendingId with the current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for PendingId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PendingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pending_{}", self.0)
    }
}

/// Boolean communication permissions derived from a trust level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommPermissions {
    /// Whether messages may be sent to this person
    pub can_message: bool,
    /// Whether content may be synchronized with this person
    pub can_sync: bool,
}

/// Outcome of a communication-permission check
///
/// `Unknown` is an explicit state: when the trust evaluator is
/// unreachable the gate never silently defaults to allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Trust was evaluated; permissions derived from fixed thresholds
    Known(CommPermissions),
    /// The trust evaluator was unavailable
    Unknown,
}

impl PermissionDecision {
    /// Permissions if known, `None` if the evaluator was unavailable
    pub fn permissions(&self) -> Option<CommPermissions> {
        match self {
            PermissionDecision::Known(p) => Some(*p),
            PermissionDecision::Unknown => None,
        }
    }
}
