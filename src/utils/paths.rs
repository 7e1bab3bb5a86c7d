//! Path handling for names that arrive from the network. Model names and hub
//! file paths end up as file names under the storage root, so every join goes
//! through this module.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum PathRejection {
    #[error("name is empty")]
    Empty,
    #[error("name contains a forbidden character")]
    ForbiddenCharacter,
    #[error("name is absolute")]
    Absolute,
    #[error("name contains an empty, \".\" or \"..\" component")]
    Traversal,
}

/// Joins `untrusted` onto `base` without ever leaving `base`.
///
/// The name is normalised lexically: empty and `.` components are dropped,
/// `..` removes the previous component and is ignored at the root, and a
/// leading `/` is treated as relative to `base`. Returns `None` when nothing
/// is left to join or the name contains a NUL byte.
pub(crate) fn secure_path(base: &Path, untrusted: &str) -> Option<PathBuf> {
    if untrusted.contains('\0') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();

    for component in untrusted.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return None;
    }

    let mut path = base.to_path_buf();
    path.extend(parts);

    Some(path)
}

/// Checks that a model name maps onto a relative path without any
/// normalisation, so that distinct names never share a route file.
pub(crate) fn validate_model_name(name: &str) -> Result<(), PathRejection> {
    if name.is_empty() {
        return Err(PathRejection::Empty);
    }

    if name.contains(|c: char| c == '\\' || c.is_control()) {
        return Err(PathRejection::ForbiddenCharacter);
    }

    if name.starts_with('/') {
        return Err(PathRejection::Absolute);
    }

    for component in name.split('/') {
        if matches!(component, "" | "." | "..") {
            return Err(PathRejection::Traversal);
        }
    }

    Ok(())
}

/// Flattens a repository file path into a single file name, e.g.
/// `Q4_K_M/model.gguf` becomes `Q4_K_M__model.gguf`.
pub(crate) fn flatten_file_name(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_start_matches('/');
    let flattened = trimmed.replace('\\', "/").replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() || sanitized.starts_with('.') {
        return None;
    }

    Some(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_path_prevents_directory_traversal() {
        let base = Path::new("/tmp/base");

        let result = secure_path(base, "../etc/passwd").unwrap();

        assert!(result.starts_with("/tmp/base/"));
        assert_eq!(result, PathBuf::from("/tmp/base/etc/passwd"));
    }

    #[test]
    fn test_secure_path_joins_within_base() {
        let base = Path::new("/tmp/base");

        assert_eq!(
            secure_path(base, "file.txt"),
            Some(PathBuf::from("/tmp/base/file.txt"))
        );
    }

    #[test]
    fn test_secure_path_hostile_inputs_stay_in_base() {
        let base = Path::new("/tmp/base");

        let hostile = [
            "/etc/passwd",
            "../../../../root/.ssh/id_rsa",
            "a/../../b",
            "..\\..\\windows",
            "./././x",
            "a/b/../../../../c",
        ];

        for name in hostile {
            let path = secure_path(base, name).expect("should produce a path");
            assert!(path.starts_with(base), "{} escaped to {:?}", name, path);
            assert_ne!(path, base.to_path_buf());
        }
    }

    #[test]
    fn test_secure_path_rejects_degenerate_names() {
        let base = Path::new("/tmp/base");

        assert_eq!(secure_path(base, ""), None);
        assert_eq!(secure_path(base, ".."), None);
        assert_eq!(secure_path(base, "a/.."), None);
        assert_eq!(secure_path(base, "nul\0byte"), None);
    }

    #[test]
    fn test_validate_model_name() {
        assert!(validate_model_name("meta-llama/Llama-3.1-8B-Instruct").is_ok());
        assert!(validate_model_name("gpt-4o-mini").is_ok());
        assert!(validate_model_name("owner/repo/Q4_K_M").is_ok());

        assert_eq!(validate_model_name(""), Err(PathRejection::Empty));
        assert_eq!(
            validate_model_name("/etc/passwd"),
            Err(PathRejection::Absolute)
        );
        assert_eq!(
            validate_model_name("../etc/passwd"),
            Err(PathRejection::Traversal)
        );
        assert_eq!(
            validate_model_name("owner//repo"),
            Err(PathRejection::Traversal)
        );
        assert_eq!(
            validate_model_name("owner/./repo"),
            Err(PathRejection::Traversal)
        );
        assert_eq!(
            validate_model_name("a\\b"),
            Err(PathRejection::ForbiddenCharacter)
        );
        assert_eq!(
            validate_model_name("line\nbreak"),
            Err(PathRejection::ForbiddenCharacter)
        );
    }

    #[test]
    fn test_flatten_file_name() {
        assert_eq!(
            flatten_file_name("Q4_K_M/model-Q4_K_M.gguf").as_deref(),
            Some("Q4_K_M__model-Q4_K_M.gguf")
        );
        assert_eq!(
            flatten_file_name("model.Q6_K.gguf").as_deref(),
            Some("model.Q6_K.gguf")
        );
        assert_eq!(flatten_file_name("a:b?.gguf").as_deref(), Some("a_b_.gguf"));
        assert_eq!(flatten_file_name(".."), None);
        assert_eq!(flatten_file_name("   "), None);
    }
}
