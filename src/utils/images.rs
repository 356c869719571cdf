//! Staging of reference images into the ComfyUI input directory.
use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult};

/// Copy `source` into `input_dir` and return the staged file name, which is
/// what `LoadImage` nodes expect as their `image` input. Copying is skipped
/// when source and destination are already the same file.
pub fn stage_input_image(source: &Path, input_dir: &Path) -> AppResult<String> {
    if !source.exists() {
        return Err(AppError::FileNotFound(source.to_path_buf()));
    }
    let name = source
        .file_name()
        .ok_or_else(|| {
            AppError::MissingArgument(format!(
                "reference image path has no file name: {}",
                source.display()
            ))
        })?
        .to_string_lossy()
        .into_owned();
    fs::create_dir_all(input_dir)?;
    let dest = input_dir.join(&name);
    let same_file = match (source.canonicalize(), dest.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_file {
        fs::copy(source, &dest)?;
        tracing::info!("staged reference image {} -> {}", source.display(), dest.display());
    }
    Ok(name)
}
