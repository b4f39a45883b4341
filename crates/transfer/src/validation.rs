use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a relative path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates a single file name: one normal component, no separators.
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    validate_upload_path(name)?;
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain file name: {name}"
        ))),
    }
}

/// Splits a relative path into `(leaf name, directory prefix)`.
///
/// `"photos/2024/a.jpg"` becomes `("a.jpg", "photos/2024")`; a bare name
/// has an empty prefix. Backslashes are treated as separators.
pub fn split_relative_path(relative: &str) -> Result<(String, String), TransferError> {
    let normalized = relative.replace('\\', "/");
    validate_upload_path(&normalized)?;

    let parts: Vec<&str> = normalized
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    let Some((leaf, dirs)) = parts.split_last() else {
        return Err(TransferError::InvalidPath(format!(
            "no file name in: {relative}"
        )));
    };
    Ok((leaf.to_string(), dirs.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_upload_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_upload_path("../../../etc/passwd").is_err());
        assert!(validate_upload_path("sub/../../../escape").is_err());
        assert!(validate_upload_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_upload_path("/tmp/malicious").is_err());
    }

    #[test]
    fn accepts_relative_paths() {
        assert!(validate_upload_path("movie.mkv").is_ok());
        assert!(validate_upload_path("sub/dir/file.txt").is_ok());
        assert!(validate_upload_path(".config/settings.json").is_ok());
        assert!(validate_upload_path("./movie.mkv").is_ok());
    }

    #[test]
    fn file_name_must_be_single_component() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("dir/report.pdf").is_err());
        assert!(validate_file_name("dir\\report.pdf").is_err());
        assert!(validate_file_name(".").is_err());
        assert!(validate_file_name("..").is_err());
    }

    #[test]
    fn split_nested_path() {
        let (leaf, prefix) = split_relative_path("photos/2024/a.jpg").unwrap();
        assert_eq!(leaf, "a.jpg");
        assert_eq!(prefix, "photos/2024");
    }

    #[test]
    fn split_bare_name() {
        let (leaf, prefix) = split_relative_path("a.jpg").unwrap();
        assert_eq!(leaf, "a.jpg");
        assert_eq!(prefix, "");
    }

    #[test]
    fn split_windows_separators() {
        let (leaf, prefix) = split_relative_path("album\\b.png").unwrap();
        assert_eq!(leaf, "b.png");
        assert_eq!(prefix, "album");
    }

    #[test]
    fn split_rejects_traversal() {
        assert!(split_relative_path("../a.jpg").is_err());
    }
}
