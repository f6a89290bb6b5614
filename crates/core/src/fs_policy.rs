//! Filesystem namespace policy.
//!
//! Every path handed to the sandbox filesystem is validated and normalized
//! here before it crosses the wire. No path may escape the namespace root,
//! whether by absolute reference or by `..` traversal.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Validates a caller-supplied path against the sandbox namespace root.
///
/// Returns the normalized path relative to the root. Rejects absolute paths
/// (POSIX and Windows-style) and any `..` component that would climb above
/// the root.
pub fn validate_path(root: &str, input: &str) -> Result<PathBuf> {
    // Windows-style absolute paths never make sense inside the namespace,
    // regardless of the host OS.
    let bytes = input.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(Error::invalid_path(format!(
            "absolute path '{}' escapes namespace root {}",
            input, root
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(input).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::invalid_path(format!(
                        "path '{}' traverses above namespace root {}",
                        input, root
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::invalid_path(format!(
                    "absolute path '{}' escapes namespace root {}",
                    input, root
                )));
            }
        }
    }

    // Belt check: joining back under the root must stay under the root.
    let root_path = Path::new(root);
    if !root_path.join(&normalized).starts_with(root_path) {
        return Err(Error::invalid_path(format!(
            "path '{}' resolves outside namespace root {}",
            input, root
        )));
    }

    Ok(normalized)
}
