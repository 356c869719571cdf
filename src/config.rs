//! Env-driven configuration for the library and CLI.
//!
//! Values are read from the process environment; `dotenv` is loaded on demand
//! by the binary. Defaults are provided for convenience during development.
use std::env;
use std::path::{Path, PathBuf};

use dotenv;

pub struct Config {
    /// Path to the pool definitions JSON document.
    pub pools_path: PathBuf,
    /// ComfyUI input directory for staged reference images. When unset, the
    /// directory is derived from the workflow path as `<workflow dir>/../input`.
    pub input_dir: Option<PathBuf>,
}

impl Config {
    pub fn dotenv_load() {
        dotenv::dotenv().ok();
    }

    pub fn new() -> Self {
        Config {
            pools_path: env::var("CASE_POOLS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/case_prompt_pools.json")),
            input_dir: env::var("COMFYUI_INPUT_DIR").ok().map(PathBuf::from),
        }
    }

    /// Resolve the staging directory for reference images next to a workflow.
    pub fn input_dir_for(&self, workflow_path: &Path) -> PathBuf {
        match &self.input_dir {
            Some(dir) => dir.clone(),
            None => workflow_path
                .parent()
                .and_then(|p| p.parent())
                .unwrap_or_else(|| Path::new("."))
                .join("input"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
