//! # mp-data
//!
//! Array storage and dataset staging for MolProp.
//!
//! Feature and target arrays live in an [`ArrayStore`] addressed by path.
//! Staging pulls both arrays into memory once, before a search starts, and
//! hands the training core an immutable [`mp_types::Dataset`].

pub mod memory;
pub mod staging;
pub mod storage;

pub use memory::InMemoryArrayStore;
pub use staging::{log10_target, stage_dataset, StagingRequest};
pub use storage::{ArrayFormat, ArrayStore, LocalArrayStore};
