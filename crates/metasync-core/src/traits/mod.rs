//! Core traits for the metasync system
//!
//! This module defines the abstract interfaces the engine drives.
//!
//! - [`RangeSource`]: Fetch published address ranges
//! - [`RangeTarget`]: Read and apply ranges at an enforcement point
//! - [`ComponentFactory`]: Build sources and targets from typed configuration
//! - [`ConfigStore`]: Declarative records and status write-back
//! - [`SecretReader`]: Credential lookup

pub mod config_store;
pub mod factory;
pub mod secrets;
pub mod source;
pub mod target;

pub use config_store::{ChangeEvent, ConfigStore};
pub use factory::ComponentFactory;
pub use secrets::SecretReader;
pub use source::RangeSource;
pub use target::{ApplyOutcome, RangeTarget};
