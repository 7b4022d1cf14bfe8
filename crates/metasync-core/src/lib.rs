// # metasync-core
//
// Core library for the metasync control loop.
//
// ## Architecture Overview
//
// This library keeps network access controls in sync with address ranges
// published by external metadata sources:
// - **AddressRangeSet**: CIDR value type with filter/merge/diff algebra
// - **RangeSource**: Trait for fetching published address ranges
// - **RangeTarget**: Trait for reading and applying ranges to an enforcement point
// - **Memo / KeyedMemo**: Single-flight, time-boxed memoization shared by sources and targets
// - **InstanceRegistry**: Process-wide cache of source/target instances, evicted on config generation change
// - **SyncEngine**: One reconciliation cycle (fetch → merge → apply → finalize)
// - **Controller**: Schedules cycles per sync spec with a bounded worker pool
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Engine logic is separate from concrete sources and targets
// 2. **Plugin-Based**: Concrete kinds live in their own crates and are wired by a factory
// 3. **Idempotency**: Targets diff before writing; an unchanged set issues no writes
// 4. **Item-Scoped Failure**: No error is fatal to the process; every cycle yields a status
// 5. **Library-First**: The daemon is a thin integration layer over this crate

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod range;
pub mod registry;
pub mod secrets;
pub mod status;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use cache::{KeyedMemo, Memo};
pub use config::{
    CloudflareTargetSettings, CredentialRef, EngineConfig, FailureMode, ForwardedForSettings,
    GatewaySelector, MeshTargetSettings, MetadataSourceSettings, RetryConfig, SourceConfig,
    SourceReference, SourceSettings, SyncSpec, TargetConfig, TargetReference, TargetSettings,
    UpdateStrategy,
};
pub use context::SyncContext;
pub use engine::{Controller, EngineEvent, SyncEngine};
pub use error::{Error, Result};
pub use range::{AddressRange, AddressRangeSet, RangeDiff};
pub use registry::{EvictionHook, InstanceRegistry};
pub use secrets::{DirectorySecretReader, MemorySecretReader};
pub use status::{AggregateStatus, ConditionState, CyclePhase, ItemOutcome, ItemStatus, ReadyCondition};
pub use store::{ConfigDocument, FileConfigStore, MemoryConfigStore};
pub use traits::{
    ApplyOutcome, ChangeEvent, ComponentFactory, ConfigStore, RangeSource, RangeTarget, SecretReader,
};
