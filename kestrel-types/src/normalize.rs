//! Input normalization helpers.

use crate::error::{Error, Result};

/// Well-known UUID the empty / literal "default" project ids collapse to
/// before persistence, so uniqueness indexes see one canonical value.
pub const DEFAULT_PROJECT_ID: &str = "00000000-0000-4000-8000-000000000000";

/// Rewrites empty or literal "default" project ids to the canonical UUID.
pub fn normalize_project_id(project_id: &str) -> String {
    let trimmed = project_id.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("default") {
        DEFAULT_PROJECT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalizes a folder path: leading "/", no trailing "/", single
/// separators, printable ASCII only. Idempotent.
pub fn normalize_folder_path(path: &str) -> Result<String> {
    if !path.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(Error::InvalidArgument(format!(
            "folder path contains non-printable characters: {:?}",
            path
        )));
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    for segment in path.split('/') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        normalized.push_str(segment);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_defaulting() {
        assert_eq!(normalize_project_id(""), DEFAULT_PROJECT_ID);
        assert_eq!(normalize_project_id("  "), DEFAULT_PROJECT_ID);
        assert_eq!(normalize_project_id("default"), DEFAULT_PROJECT_ID);
        assert_eq!(normalize_project_id("Default"), DEFAULT_PROJECT_ID);
        assert_eq!(normalize_project_id("proj-1"), "proj-1");
    }

    #[test]
    fn test_folder_path_normalization() {
        assert_eq!(normalize_folder_path("a/b/c").unwrap(), "/a/b/c");
        assert_eq!(normalize_folder_path("/a/b/c/").unwrap(), "/a/b/c");
        assert_eq!(normalize_folder_path("//a///b//").unwrap(), "/a/b");
        assert_eq!(normalize_folder_path("").unwrap(), "/");
        assert_eq!(normalize_folder_path("/").unwrap(), "/");
    }

    #[test]
    fn test_folder_path_normalization_idempotent() {
        for input in ["a/b", "/a/b/", "//x//y//z", "", "/deep/nested/path"] {
            let once = normalize_folder_path(input).unwrap();
            let twice = normalize_folder_path(&once).unwrap();
            assert_eq!(once, twice, "input {:?}", input);
        }
    }

    #[test]
    fn test_folder_path_rejects_non_printable() {
        assert!(normalize_folder_path("a/\u{7}/b").is_err());
        assert!(normalize_folder_path("a/\n/b").is_err());
    }
}
