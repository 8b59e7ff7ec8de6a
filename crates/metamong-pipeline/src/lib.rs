//! metamong-pipeline library.
//!
//! The worker roles that carry a seed from generation to a bisected,
//! minimized finding, and the [`stage::Pipeline`] that runs them stage by
//! stage over a [`metamong_core::VersionedWorkQueue`].

pub mod bisect;
pub mod confirm;
pub mod generate;
pub mod minimize;
pub mod mutator;
pub mod stage;
pub mod worker;

pub use mutator::{MetaMutator, MetaMutatorFactory};
pub use stage::{Collaborators, Pipeline, PipelineOptions, PipelineReport, Stage, StageReport};
pub use worker::{Disposition, DropReason, Role, Worker, WorkerConfig, WorkerStats};
