//! metamong-sim library.
//!
//! Runs the real pipeline against a seeded, in-process browser fleet whose
//! regression point and broken builds are known up front.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod browser;
pub mod campaign;
pub mod rng;
pub mod world;

pub use campaign::{CampaignConfig, CampaignReport, SeedFailure, SeedTrace, Violation};
pub use world::{SimWorld, WorldConfig};
