//! CASE prompt generation and ComfyUI workflow patching.
//!
//! Modules:
//! - `pools`: Loading and mode-blended merging of the token pool definitions.
//! - `prompt`: Deterministic CASE prompt sampling and line rendering.
//! - `workflow`: In-memory workflow graph model and the patch engine.
//! - `utils`: Small helpers: reference-image staging, override parsing.
//! - `config`: Env-driven configuration loader.
//! - `error`: Common error type and alias.
//!
//! Re-exports are provided for common types: `Config`, `PoolStore`,
//! `MergedPool`, `CasePrompt`, and `PatchSession`.
pub mod config;
pub mod error;
pub mod pools;
pub mod prompt;
pub mod utils;
pub mod workflow;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use pools::store::{MergedPool, PoolStore};
pub use prompt::sampler::CasePrompt;
pub use workflow::patch::PatchSession;
