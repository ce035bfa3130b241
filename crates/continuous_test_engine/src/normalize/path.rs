//! Path normalization and class-name mapping for compiled class artifacts.
//!
//! Normalizes paths to forward slashes and maps `*.class` files under an
//! output root to dotted class names.

use std::path::Path;
use thiserror::Error;

/// File extension of compiled class artifacts.
const CLASS_EXTENSION: &str = ".class";

/// Maximum length of a mapped class name.
const MAX_CLASS_NAME_LEN: usize = 1024;

/// Errors that can occur while mapping an artifact path to a class name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is not under the output root")]
    OutsideRoot,
    #[error("path is not a compiled class file")]
    NotClassFile,
    #[error("path contains disallowed '..' component")]
    PathTraversal,
    #[error("path contains invalid characters")]
    InvalidChars,
    #[error("class name exceeds maximum length of {0} characters")]
    TooLong(usize),
}

/// Normalizes a path to use forward slashes only.
///
/// - Converts backslashes to forward slashes
/// - Collapses consecutive slashes
pub fn normalize_slashes(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut last_was_slash = false;

    for c in path.chars() {
        let is_slash = c == '/' || c == '\\';
        if is_slash {
            if !last_was_slash {
                result.push('/');
            }
            last_was_slash = true;
        } else {
            result.push(c);
            last_was_slash = false;
        }
    }
    result
}

/// Check if a path names a compiled class file.
pub fn is_class_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.len() > CLASS_EXTENSION.len() && n.ends_with(CLASS_EXTENSION))
}

/// Map `<root>/org/acme/Foo.class` to `org.acme.Foo`.
///
/// Nested classes keep their `$` separator (`Outer$Inner`).
pub fn class_name_from_path(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path.strip_prefix(root).map_err(|_| PathError::OutsideRoot)?;
    let relative = relative.to_str().ok_or(PathError::InvalidChars)?;
    let relative = normalize_slashes(relative);
    let relative = relative.trim_start_matches('/');

    let stem = relative
        .strip_suffix(CLASS_EXTENSION)
        .filter(|s| !s.is_empty() && !s.ends_with('/'))
        .ok_or(PathError::NotClassFile)?;

    let mut name = String::with_capacity(stem.len());
    for (i, component) in stem.split('/').enumerate() {
        if component == ".." {
            return Err(PathError::PathTraversal);
        }
        if component.is_empty() || component.contains('.') {
            return Err(PathError::InvalidChars);
        }
        if i > 0 {
            name.push('.');
        }
        name.push_str(component);
    }

    if name.len() > MAX_CLASS_NAME_LEN {
        return Err(PathError::TooLong(MAX_CLASS_NAME_LEN));
    }
    Ok(name)
}
