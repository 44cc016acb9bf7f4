//! Per-(owner, bot) path resolution.
//!
//! Owner and bot identifiers become directory names under the sessions,
//! deployments and configs roots. Each identifier must be exactly one
//! normal path component so a crafted id can never address a directory
//! outside its root.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Validate that `id` is usable as a single directory name.
///
/// # Errors
///
/// Returns `AppError::Validation` if the id is empty, contains a path
/// separator, or is a `.`/`..` segment.
pub fn validate_component(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(AppError::Validation(format!("{kind} id must not be empty")));
    }

    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == id && !id.contains(['/', '\\']) => Ok(()),
        _ => Err(AppError::Validation(format!(
            "{kind} id '{id}' is not a valid path component"
        ))),
    }
}

/// Resolve `<root>/<owner>/<bot>` after validating both identifiers.
///
/// # Errors
///
/// Returns `AppError::Validation` if either identifier is unsafe.
pub fn scoped_dir(root: &Path, owner_id: &str, bot_id: &str) -> Result<PathBuf> {
    validate_component("owner", owner_id)?;
    validate_component("bot", bot_id)?;
    Ok(root.join(owner_id).join(bot_id))
}
