//! Entrypoint discovery inside a cloned source tree.
//!
//! Resolution order:
//! 1. the first configured conventional name that exists as a file;
//! 2. the manifest's `main` field, when it names an existing file;
//! 3. the alphabetically first top-level `*.<ext>` file that is not a test.

use std::path::Path;

use tracing::debug;

use crate::config::DeployConfig;
use crate::{AppError, Result};

/// Error message recorded when nothing runnable is found.
pub const NO_ENTRYPOINT_MESSAGE: &str = "No main bot file found";

/// Locate the entrypoint in `dir`, returned relative to `dir`.
///
/// # Errors
///
/// Returns `AppError::NoEntrypoint` if no candidate exists.
pub fn find_entrypoint(dir: &Path, config: &DeployConfig) -> Result<String> {
    if let Some(name) = config
        .entrypoints
        .iter()
        .find(|name| dir.join(name.as_str()).is_file())
    {
        debug!(entrypoint = %name, "conventional entrypoint found");
        return Ok(name.clone());
    }

    if let Some(main) = manifest_main(dir, &config.manifest_file) {
        debug!(entrypoint = %main, "manifest entrypoint found");
        return Ok(main);
    }

    if let Some(file) = first_source_file(dir, &config.source_extension) {
        debug!(entrypoint = %file, "fallback source file found");
        return Ok(file);
    }

    Err(AppError::NoEntrypoint(NO_ENTRYPOINT_MESSAGE.into()))
}

fn manifest_main(dir: &Path, manifest_file: &str) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join(manifest_file)).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let main = manifest.get("main")?.as_str()?.trim();
    let main = main.strip_prefix("./").unwrap_or(main);

    if main.is_empty() || Path::new(main).is_absolute() || main.contains("..") {
        return None;
    }
    dir.join(main).is_file().then(|| main.to_owned())
}

fn first_source_file(dir: &Path, extension: &str) -> Option<String> {
    let pattern = format!(
        "{}/*.{}",
        glob::Pattern::escape(dir.to_str()?),
        glob::Pattern::escape(extension)
    );

    let mut names: Vec<String> = glob::glob(&pattern)
        .ok()?
        .filter_map(std::result::Result::ok)
        .filter(|path| path.is_file())
        .filter_map(|path| path.file_name()?.to_str().map(str::to_owned))
        .filter(|name| !is_test_file(name))
        .collect();

    names.sort();
    names.into_iter().next()
}

fn is_test_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("test") || lower.contains(".test.") || lower.contains(".spec.")
}
