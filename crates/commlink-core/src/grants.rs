//! Channel access coordination
//!
//! Decides which persons should see which channel objects and issues
//! capability grants through the access-control port:
//!
//! - Pair channels get exactly one grant naming both persons, with an
//!   empty group set. Access to a bilateral channel must never be
//!   reachable via group membership.
//! - A person joining a multi-party channel gets a grant for the channel
//!   root plus one per historical entry, so a new member can read
//!   everything that existed at join time, not only future entries.
//! - Two single-owner channels that reference each other get reciprocal
//!   grants so each owner's channel becomes readable by the other.
//!
//! Grants are additive and idempotent: a duplicate-grant conflict from
//! the port is success. On partial failure mid-batch nothing is rolled
//! back; each grant is independently safe to retry, so the coordinator
//! reports which targets succeeded and which failed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CommError, CommResult};
use crate::ports::AccessControl;
use crate::types::{CapabilityGrant, IdHash, PersonId};

/// Outcome of a multi-grant operation
#[derive(Debug, Clone, Default)]
pub struct GrantBatchReport {
    /// Targets whose grant was recorded (or already existed)
    pub granted: Vec<IdHash>,
    /// Targets whose grant failed, with the error description
    pub failed: Vec<(IdHash, String)>,
}

impl GrantBatchReport {
    /// Whether every grant in the batch succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Issues capability grants for channel events
pub struct AccessCoordinator {
    access: Arc<dyn AccessControl>,
}

impl AccessCoordinator {
    /// Create a coordinator over the given access-control port
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self { access }
    }

    /// Record a single grant, absorbing duplicate-grant conflicts.
    ///
    /// Grants are cumulative; re-issuing an existing grant is a no-op,
    /// not an error. Any other port failure propagates.
    pub async fn issue(&self, grant: &CapabilityGrant) -> CommResult<()> {
        if !grant.is_valid() {
            return Err(CommError::Validation(
                "grant must name at least one person or group".to_string(),
            ));
        }

        match self.access.grant_access(grant).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(target_obj = %grant.target, "Grant already recorded, treating as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Grant both persons of a pair channel access to its root.
    ///
    /// Must be called before or atomically with the first message write
    /// to the channel, so neither participant can ever see a channel
    /// containing a message they cannot read.
    pub async fn grant_bilateral(
        &self,
        channel_root: IdHash,
        a: &PersonId,
        b: &PersonId,
    ) -> CommResult<()> {
        let grant = CapabilityGrant::bilateral(channel_root, a.clone(), b.clone());
        self.issue(&grant).await?;

        debug!(
            channel_root = %channel_root,
            person_a = %a,
            person_b = %b,
            "Issued bilateral channel grant"
        );
        Ok(())
    }

    /// Grant a new member access to a multi-party channel and its history.
    ///
    /// Issues one grant for the channel root plus one per historical
    /// entry. Partial failures are reported, not rolled back.
    pub async fn grant_group_member(
        &self,
        channel_root: IdHash,
        person: &PersonId,
        history: &[IdHash],
    ) -> CommResult<GrantBatchReport> {
        let mut report = GrantBatchReport::default();

        let mut targets = Vec::with_capacity(history.len() + 1);
        targets.push(channel_root);
        targets.extend_from_slice(history);

        for target in targets {
            let grant = CapabilityGrant::for_person(target, person.clone());
            match self.issue(&grant).await {
                Ok(()) => report.granted.push(target),
                Err(e) => {
                    warn!(
                        target_obj = %target,
                        person = %person,
                        error = %e,
                        "Backfill grant failed, continuing with remaining entries"
                    );
                    report.failed.push((target, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            debug!(
                channel_root = %channel_root,
                person = %person,
                entries = history.len(),
                "Backfilled member access over full channel history"
            );
        } else {
            warn!(
                channel_root = %channel_root,
                person = %person,
                granted = report.granted.len(),
                failed = report.failed.len(),
                "Member backfill incomplete; failed grants are safe to retry"
            );
        }

        Ok(report)
    }

    /// Cross-grant two single-owner channels so each owner can read the
    /// other's channel.
    pub async fn grant_mutual(
        &self,
        channel_a: IdHash,
        channel_b: IdHash,
        owner_a: &PersonId,
        owner_b: &PersonId,
    ) -> CommResult<()> {
        self.issue(&CapabilityGrant::for_person(channel_a, owner_b.clone()))
            .await?;
        self.issue(&CapabilityGrant::for_person(channel_b, owner_a.clone()))
            .await?;

        debug!(
            channel_a = %channel_a,
            channel_b = %channel_b,
            "Issued reciprocal grants between owned channels"
        );
        Ok(())
    }
}
