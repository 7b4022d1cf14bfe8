// # Config Store Implementations
//
// This module provides implementations of the ConfigStore trait for
// different backing stores.

pub mod file;
pub mod memory;

pub use file::{ConfigDocument, FileConfigStore};
pub use memory::MemoryConfigStore;

/// Capacity of the change-notification channel
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;
