// # Range Target Trait
//
// Defines the interface for enforcement points that hold a trusted range set.
//
// ## Implementations
//
// - Firewall rule: `metasync-target-cloudflare` crate
// - Document + header filter: `metasync-target-mesh` crate
//
// ## Idempotency
//
// `apply` compares the desired set with what is applied and performs no
// external writes when the two hold the same CIDRs. Targets remember the
// last set they applied and only read the remote state back when that memo
// is empty or older than their cache TTL.

use crate::config::TargetConfig;
use crate::context::SyncContext;
use crate::range::AddressRangeSet;
use async_trait::async_trait;

/// Result of an apply call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied state already matched; nothing was written
    Unchanged,
    /// The applied state was replaced
    Applied {
        /// CIDRs newly present
        added: usize,
        /// CIDRs no longer present
        removed: usize,
    },
}

impl ApplyOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ApplyOutcome::Unchanged)
    }
}

/// Trait for enforcement target implementations
#[async_trait]
pub trait RangeTarget: Send + Sync {
    /// Configured name of this target (for logging and status)
    fn name(&self) -> &str;

    /// Apply typed configuration and the resolved credential
    ///
    /// Called exactly once, before the instance is shared.
    async fn initialize(
        &mut self,
        config: &TargetConfig,
        credential: Option<String>,
    ) -> Result<(), crate::Error>;

    /// Read the currently-applied ranges
    ///
    /// # Returns
    ///
    /// - `Ok(AddressRangeSet)`: Applied ranges (empty when nothing is managed yet)
    /// - `Err(Error::Read)`: Remote state unreadable or unparsable
    async fn read_applied(&self, ctx: &SyncContext) -> Result<AddressRangeSet, crate::Error>;

    /// Make the applied ranges equal to `desired`
    ///
    /// Must issue zero external writes when the CIDRs already match.
    async fn apply(
        &self,
        ctx: &SyncContext,
        desired: &AddressRangeSet,
    ) -> Result<ApplyOutcome, crate::Error>;
}
