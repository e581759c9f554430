// src/cache/mod.rs

//! Compile cache: the fingerprint store and the validity check that decides
//! whether an artifact can be reused.
//!
//! - [`record`]: typed records and their text descriptor.
//! - [`stamp`]: the environment stamp heading the store file.
//! - [`store`]: load / get / put / remove of records.
//! - [`checker`]: the up-to-date check.
//! - [`artifact`]: removing or renaming aside a previous artifact.

pub mod artifact;
pub mod checker;
pub mod record;
pub mod stamp;
pub mod store;

pub use checker::{CacheChecker, CacheVerdict, StaleReason, project_members_hash};
pub use record::{CacheRecord, DependencyRef, RecordError};
pub use stamp::EnvironmentStamp;
pub use store::FingerprintStore;
