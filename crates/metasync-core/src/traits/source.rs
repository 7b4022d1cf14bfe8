// # Range Source Trait
//
// Defines the interface for fetching published address ranges.
//
// ## Implementations
//
// - Metadata endpoint: `metasync-source-metadata` crate
//
// ## Lifecycle
//
// A source is built once per distinct name by the instance registry,
// initialized with its typed configuration and credential, and then shared
// across cycles. It memoizes its last successful fetch for its polling
// interval, so most cycles never reach the network.

use crate::config::SourceConfig;
use crate::context::SyncContext;
use crate::range::AddressRangeSet;
use async_trait::async_trait;

/// Trait for address-range source implementations
///
/// # Thread Safety
///
/// Instances are shared behind `Arc` across concurrently running cycles.
/// Any internal state must use interior mutability scoped to the instance.
///
/// # Cancellation
///
/// External calls must run through [`SyncContext::run`] so a cycle deadline
/// or shutdown interrupts them.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Configured name of this source (for logging and status)
    fn name(&self) -> &str;

    /// Apply typed configuration and the resolved credential
    ///
    /// Called exactly once, before the instance is shared. Returns
    /// [`crate::Error::Init`] when the settings are not for this kind or are
    /// unusable.
    async fn initialize(
        &mut self,
        config: &SourceConfig,
        credential: Option<String>,
    ) -> Result<(), crate::Error>;

    /// Fetch the current ranges
    ///
    /// # Returns
    ///
    /// - `Ok(AddressRangeSet)`: Ranges labelled with their categories
    /// - `Err(Error::Fetch)`: Upstream unreachable, non-success status, or undecodable body
    async fn fetch(&self, ctx: &SyncContext) -> Result<AddressRangeSet, crate::Error>;
}
