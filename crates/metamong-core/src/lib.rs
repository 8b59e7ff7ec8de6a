//! metamong-core library.
//!
//! Shared building blocks for the regression-hunting pipeline: the
//! two-generation [`queue::VersionedWorkQueue`], the hang [`watchdog::Watchdog`],
//! the per-revision [`provision::BinaryCache`], and the narrow traits through
//! which the pipeline talks to browsers and binary builders.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums at module seams, `anyhow::Result` where a
//!   caller only reports the failure.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod config;
pub mod error;
pub mod item;
pub mod lock;
pub mod oracle;
pub mod persist;
pub mod provision;
pub mod queue;
pub mod verdict;
pub mod version;
pub mod watchdog;

pub use item::WorkItem;
pub use queue::VersionedWorkQueue;
pub use verdict::Verdict;
pub use version::{Revision, RevisionList, VersionKey};
