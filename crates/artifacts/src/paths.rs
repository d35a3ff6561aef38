// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filename and path confinement checks.

use std::path::Path;

/// Longest accepted filename, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Validate a filename for use under a managed root.
///
/// Rejects empty names, path separators, parent references, NUL bytes, and
/// over-long names. Returns the name unchanged on success.
pub fn sanitize_filename(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("filename is empty".to_string());
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(format!("filename exceeds {MAX_FILENAME_LEN} bytes"));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(format!("filename contains path separators or NUL: {name:?}"));
    }
    if name == "." || name == ".." {
        return Err(format!("filename is a directory reference: {name:?}"));
    }
    Ok(name)
}

/// Check that `path`, after resolving symlinks in its existing ancestry,
/// stays under `root`.
///
/// The final component may not exist yet; its parent must.
pub fn confined(root: &Path, path: &Path) -> std::io::Result<bool> {
    let root = root.canonicalize()?;
    let check = if path.exists() {
        path.canonicalize()?
    } else {
        let parent = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
        })?;
        let name = path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        parent.canonicalize()?.join(name)
    };
    Ok(check.starts_with(&root))
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
