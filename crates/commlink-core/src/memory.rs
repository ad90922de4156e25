//! In-memory port adapters
//!
//! Process-local implementations of every port, used by the test suite
//! and by embedders that want a self-contained engine. A single
//! [`MemoryStore`] can back several engines at once, which is how the
//! tests simulate two peers racing against one shared store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CommError, CommResult};
use crate::ports::{
    AccessControl, ChannelDirectory, ObjectStore, PayloadKind, PeerTransport, TrustAction,
    TrustEvaluation, TrustEvaluator, TrustStatus,
};
use crate::types::{
    CapabilityGrant, ChannelIdentity, ChannelInfo, GroupRef, IdHash, ObjectHash, PersonId,
    StoreReceipt,
};

/// In-memory object store, access-control layer, and channel directory.
///
/// Identity hashes are content-keyed; objects are never superseded in
/// memory. Duplicate grants and duplicate channel creation surface as
/// [`CommError::Conflict`], matching the contracts the coordinators
/// recover from.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ObjectHash, Vec<u8>>>,
    by_id: Mutex<HashMap<IdHash, ObjectHash>>,
    person_grants: Mutex<HashSet<(IdHash, PersonId)>>,
    group_grants: Mutex<HashSet<(IdHash, GroupRef)>>,
    channels: Mutex<HashMap<ChannelIdentity, ChannelInfo>>,
    fail_grant_targets: Mutex<HashSet<IdHash>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make grants on the given target fail with a store error
    pub fn fail_grants_on(&self, target: IdHash) {
        self.fail_grant_targets.lock().insert(target);
    }

    /// Whether a direct person grant exists for the target
    pub fn person_has_access(&self, person: &PersonId, target: &IdHash) -> bool {
        self.person_grants
            .lock()
            .contains(&(*target, person.clone()))
    }

    /// Whether any group grant exists for the target
    pub fn group_has_access(&self, group: &GroupRef, target: &IdHash) -> bool {
        self.group_grants.lock().contains(&(*target, group.clone()))
    }

    /// Total number of recorded group grants
    pub fn group_grant_count(&self) -> usize {
        self.group_grants.lock().len()
    }

    /// Total number of recorded person grants
    pub fn person_grant_count(&self) -> usize {
        self.person_grants.lock().len()
    }

    /// Number of channels in the directory
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn check_available(&self) -> CommResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CommError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn store_versioned(&self, bytes: &[u8]) -> CommResult<StoreReceipt> {
        self.check_available()?;
        let hash = ObjectHash::digest(bytes);
        let id_hash = IdHash::derive(&hex::encode(hash.as_bytes()));
        self.objects.lock().insert(hash, bytes.to_vec());
        self.by_id.lock().insert(id_hash, hash);
        Ok(StoreReceipt { hash, id_hash })
    }

    async fn store_unversioned(&self, bytes: &[u8]) -> CommResult<ObjectHash> {
        self.check_available()?;
        let hash = ObjectHash::digest(bytes);
        self.objects.lock().insert(hash, bytes.to_vec());
        Ok(hash)
    }

    async fn get_by_id_hash(&self, id: &IdHash) -> CommResult<Vec<u8>> {
        self.check_available()?;
        let hash = self
            .by_id
            .lock()
            .get(id)
            .copied()
            .ok_or_else(|| CommError::NotFound(format!("{}", id)))?;
        self.get_by_hash(&hash).await
    }

    async fn get_by_hash(&self, hash: &ObjectHash) -> CommResult<Vec<u8>> {
        self.check_available()?;
        self.objects
            .lock()
            .get(hash)
            .cloned()
            .ok_or_else(|| CommError::NotFound(format!("{}", hash)))
    }
}

#[async_trait]
impl AccessControl for MemoryStore {
    async fn grant_access(&self, grant: &CapabilityGrant) -> CommResult<()> {
        self.check_available()?;

        if self.fail_grant_targets.lock().contains(&grant.target) {
            return Err(CommError::StoreUnavailable(format!(
                "injected grant failure for {}",
                grant.target
            )));
        }

        let mut persons = self.person_grants.lock();
        let mut groups = self.group_grants.lock();

        let person_pairs: Vec<_> = grant
            .persons
            .iter()
            .map(|p| (grant.target, p.clone()))
            .collect();
        let group_pairs: Vec<_> = grant
            .groups
            .iter()
            .map(|g| (grant.target, g.clone()))
            .collect();

        let all_present = person_pairs.iter().all(|p| persons.contains(p))
            && group_pairs.iter().all(|g| groups.contains(g));
        if all_present {
            return Err(CommError::Conflict(format!(
                "equivalent grant already recorded for {}",
                grant.target
            )));
        }

        for pair in person_pairs {
            persons.insert(pair);
        }
        for pair in group_pairs {
            groups.insert(pair);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelDirectory for MemoryStore {
    async fn create_channel(&self, identity: &ChannelIdentity) -> CommResult<ChannelInfo> {
        self.check_available()?;

        let mut channels = self.channels.lock();
        if channels.contains_key(identity) {
            return Err(CommError::Conflict(format!(
                "channel {} already exists",
                identity
            )));
        }

        let info = ChannelInfo {
            identity: identity.clone(),
            root: identity.root_id_hash(),
            created_at: chrono::Utc::now().timestamp(),
        };
        channels.insert(identity.clone(), info.clone());
        Ok(info)
    }

    async fn find_channel(&self, identity: &ChannelIdentity) -> CommResult<Option<ChannelInfo>> {
        self.check_available()?;
        Ok(self.channels.lock().get(identity).cloned())
    }
}

/// Trust evaluator with scripted levels, for tests
#[derive(Default)]
pub struct ScriptedTrust {
    levels: Mutex<HashMap<PersonId, f64>>,
    statuses: Mutex<HashMap<PersonId, TrustStatus>>,
    available: AtomicBool,
}

impl ScriptedTrust {
    /// Create an available evaluator with no scripted levels
    pub fn new() -> Self {
        let trust = Self::default();
        trust.available.store(true, Ordering::SeqCst);
        trust
    }

    /// Script the trust level for a person
    pub fn set_level(&self, person: PersonId, level: f64) {
        self.levels.lock().insert(person, level);
    }

    /// Script the coarse status for a person
    pub fn set_status(&self, person: PersonId, status: TrustStatus) {
        self.statuses.lock().insert(person, status);
    }

    /// Simulate the evaluator going offline
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrustEvaluator for ScriptedTrust {
    async fn evaluate(
        &self,
        person: &PersonId,
        _action: TrustAction,
    ) -> CommResult<TrustEvaluation> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CommError::StoreUnavailable(
                "trust evaluator offline".to_string(),
            ));
        }
        let level = self.levels.lock().get(person).copied().unwrap_or(0.0);
        Ok(TrustEvaluation { level })
    }

    async fn status(&self, person: &PersonId) -> CommResult<TrustStatus> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(CommError::StoreUnavailable(
                "trust evaluator offline".to_string(),
            ));
        }
        Ok(self
            .statuses
            .lock()
            .get(person)
            .copied()
            .unwrap_or(TrustStatus::Unknown))
    }
}

/// A payload captured by [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct SentPayload {
    /// Destination peer
    pub to: PersonId,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Declared payload kind
    pub kind: PayloadKind,
}

/// Transport that records every send, with per-kind failure injection
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentPayload>>,
    failing_kinds: Mutex<HashSet<PayloadKind>>,
}

impl MemoryTransport {
    /// Create a transport that records and always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends of the given kind fail
    pub fn fail_on(&self, kind: PayloadKind) {
        self.failing_kinds.lock().insert(kind);
    }

    /// All captured sends, in order
    pub fn sent(&self) -> Vec<SentPayload> {
        self.sent.lock().clone()
    }

    /// Number of captured sends of the given kind
    pub fn sent_count(&self, kind: PayloadKind) -> usize {
        self.sent.lock().iter().filter(|s| s.kind == kind).count()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send_to_peer(
        &self,
        peer: &PersonId,
        payload: &[u8],
        kind: PayloadKind,
    ) -> CommResult<()> {
        if self.failing_kinds.lock().contains(&kind) {
            return Err(CommError::Transport(format!(
                "injected send failure to {}",
                peer
            )));
        }
        self.sent.lock().push(SentPayload {
            to: peer.clone(),
            payload: payload.to_vec(),
            kind,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let store = MemoryStore::new();

        let receipt = store.store_versioned(b"hello").await.unwrap();
        assert_eq!(store.get_by_hash(&receipt.hash).await.unwrap(), b"hello");
        assert_eq!(
            store.get_by_id_hash(&receipt.id_hash).await.unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = store.store_unversioned(b"x").await;
        assert!(matches!(result, Err(CommError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_duplicate_channel_conflicts() {
        let store = MemoryStore::new();
        let identity =
            ChannelIdentity::between(&PersonId::new("a"), &PersonId::new("b"));

        store.create_channel(&identity).await.unwrap();
        let second = store.create_channel(&identity).await;
        assert!(matches!(second, Err(CommError::Conflict(_))));
        assert_eq!(store.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_grant_conflicts() {
        let store = MemoryStore::new();
        let grant = CapabilityGrant::for_person(IdHash::derive("x"), PersonId::new("a"));

        store.grant_access(&grant).await.unwrap();
        let second = store.grant_access(&grant).await;
        assert!(matches!(second, Err(CommError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_scripted_trust_default_level() {
        let trust = ScriptedTrust::new();
        let eval = trust
            .evaluate(&PersonId::new("stranger"), TrustAction::Communication)
            .await
            .unwrap();
        assert_eq!(eval.level, 0.0);
    }

    #[tokio::test]
    async fn test_transport_failure_injection() {
        let transport = MemoryTransport::new();
        transport.fail_on(PayloadKind::Credential);

        let result = transport
            .send_to_peer(&PersonId::new("bob"), b"cred", PayloadKind::Credential)
            .await;
        assert!(matches!(result, Err(CommError::Transport(_))));

        transport
            .send_to_peer(&PersonId::new("bob"), b"hi", PayloadKind::Welcome)
            .await
            .unwrap();
        assert_eq!(transport.sent_count(PayloadKind::Welcome), 1);
        assert_eq!(transport.sent_count(PayloadKind::Credential), 0);
    }
}
