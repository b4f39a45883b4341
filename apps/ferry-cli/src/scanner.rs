//! Expands command-line paths into upload entries.
//!
//! A file argument uploads under its own name; a directory argument
//! uploads its whole tree under the directory's name, with relative
//! paths normalized to forward slashes.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};

/// One file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub local: PathBuf,
    pub relative_path: String,
    pub size: u64,
}

pub fn scan(paths: &[PathBuf]) -> anyhow::Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for path in paths {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let name = file_name(path)?;

        if metadata.is_dir() {
            walk_dir(path, &name, &mut files)?;
        } else if metadata.is_file() {
            files.push(ScannedFile {
                local: path.clone(),
                relative_path: name,
                size: metadata.len(),
            });
        } else {
            bail!("{} is not a regular file or directory", path.display());
        }
    }
    Ok(files)
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    match path.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("{} has no file name", path.display()),
    }
}

fn walk_dir(current: &Path, prefix: &str, files: &mut Vec<ScannedFile>) -> anyhow::Result<()> {
    let mut entries = std::fs::read_dir(current)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = entry.metadata()?;
        let rel = format!("{prefix}/{}", entry.file_name().to_string_lossy());

        if metadata.is_dir() {
            walk_dir(&path, &rel, files)?;
        } else if metadata.is_file() {
            files.push(ScannedFile {
                local: path,
                relative_path: rel.replace('\\', "/"),
                size: metadata.len(),
            });
        }
    }
    Ok(())
}
