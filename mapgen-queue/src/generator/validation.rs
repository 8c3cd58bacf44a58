//! Checks for user-supplied file names and provider settings.
//!
//! File names arrive as bare names that must resolve inside a trusted base
//! directory. Settings are free-form JSON and are screened for shell
//! injection patterns before they reach the generator.

use regex::Regex;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::error::ValidationError;

/// Longest accepted file name.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Longest accepted string value in provider settings.
pub const MAX_SETTING_LENGTH: usize = 10_000;

const DANGEROUS_CHARS: &[char] = &[';', '|', '&', '$', '`', '\n', '\r', '<', '>'];

static SUSPICIOUS_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i);\s*wget|;\s*curl|\$\(|`|\|\s*sh|\|\s*bash|eval\s*\(|exec\s*\(|__import__|subprocess|os\.system",
    )
    .expect("suspicious value pattern is valid")
});

/// Validate that a bare file name is safe to join onto a base directory.
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(ValidationError::EmptyFilename);
    }
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(ValidationError::FilenameTooLong {
            max: MAX_FILENAME_LENGTH,
        });
    }
    if filename.contains('\0') {
        return Err(ValidationError::NullByte);
    }
    if filename.contains("..") {
        return Err(ValidationError::PathTraversal);
    }
    if filename.starts_with('/') || filename.starts_with('\\') {
        return Err(ValidationError::AbsolutePath);
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(ValidationError::DirectorySeparator);
    }
    if let Some(c) = filename.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(ValidationError::DangerousCharacter(c));
    }
    if filename.starts_with('-') {
        return Err(ValidationError::LeadingDash);
    }
    Ok(())
}

/// Join `user_path` onto `base`, refusing results outside `base`.
///
/// Existing paths are resolved through symlinks; missing ones are
/// normalized lexically.
pub fn safe_path_join(base: &Path, user_path: &str) -> Result<PathBuf, ValidationError> {
    if user_path.is_empty() {
        return Err(ValidationError::EmptyFilename);
    }
    if user_path.contains('\0') {
        return Err(ValidationError::NullByte);
    }

    let base = resolve(base);
    let target = resolve(&base.join(user_path));
    if !target.starts_with(&base) {
        return Err(ValidationError::EscapesBase(user_path.to_string()));
    }
    Ok(target)
}

fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize_lexically(path))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Validate that `path` exists and is a regular file.
pub fn validate_path_exists(path: &Path) -> Result<(), ValidationError> {
    if !path.exists() {
        return Err(ValidationError::Missing(path.display().to_string()));
    }
    if !path.is_file() {
        return Err(ValidationError::NotAFile(path.display().to_string()));
    }
    Ok(())
}

/// Resolve a user-supplied file name inside `base`.
///
/// Runs every file check in order: name, containment, existence. The file
/// type is left to the generator, which knows its own formats.
pub fn resolve_user_file(base: &Path, filename: &str) -> Result<PathBuf, ValidationError> {
    validate_filename(filename)?;
    let path = safe_path_join(base, filename)?;
    validate_path_exists(&path)?;
    Ok(path)
}

/// Screen settings for oversized strings and shell injection patterns.
///
/// Nested objects and arrays are walked recursively.
pub fn sanitize_settings(value: &Value, max_string_length: usize) -> Result<(), ValidationError> {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::String(s) => check_string(key, s, max_string_length)?,
                    other => sanitize_settings(other, max_string_length)?,
                }
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| sanitize_settings(item, max_string_length)),
        _ => Ok(()),
    }
}

fn check_string(key: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::ValueTooLong {
            key: key.to_string(),
            max,
        });
    }
    if SUSPICIOUS_VALUE.is_match(value) {
        return Err(ValidationError::SuspiciousValue(key.to_string()));
    }
    Ok(())
}
