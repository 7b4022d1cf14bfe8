//! Construction of concrete sources and targets

use crate::config::{SourceConfig, TargetConfig};
use crate::traits::{RangeSource, RangeTarget};

/// Builds uninitialized sources and targets for a configuration's kind
///
/// Implementations match exhaustively on [`crate::SourceSettings`] and
/// [`crate::TargetSettings`]. The registry calls `initialize` on the result.
pub trait ComponentFactory: Send + Sync {
    fn build_source(&self, config: &SourceConfig) -> Result<Box<dyn RangeSource>, crate::Error>;

    fn build_target(&self, config: &TargetConfig) -> Result<Box<dyn RangeTarget>, crate::Error>;
}
