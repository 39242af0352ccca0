//! Tandem kubehub – API backends behind the [`tandem_core::Backend`] contract.
//!
//! - [`KubeBackend`]: a live cluster via kube-rs (`Api<DynamicObject>`).
//! - [`MemoryBackend`]: an in-process API server used by tests and `tandemctl repro`.

#![forbid(unsafe_code)]

mod cluster;
pub mod memory;

pub use cluster::KubeBackend;
pub use memory::{BackendStats, MemoryBackend, Op};
