//! Discovery of datasets under a `<root>/<folder>/<dataset>.zarr` layout.

use crate::error::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DATASET_EXTENSION: &str = "zarr";

/// A folder directly under the data root and the datasets it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFolder {
    pub name: String,
    pub path: PathBuf,
    /// Sorted by path.
    pub datasets: Vec<PathBuf>,
}

impl DataFolder {
    /// The dataset a folder-level preview is drawn from.
    pub fn first(&self) -> Option<&Path> {
        self.datasets.first().map(PathBuf::as_path)
    }
}

fn is_dataset(path: &Path) -> bool {
    path.is_dir() && path.extension().is_some_and(|ext| ext == DATASET_EXTENSION)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Folders under `root` that contain at least one dataset, sorted by name.
/// Hidden folders and datasets sitting directly in `root` are ignored.
pub fn scan_data_root(root: &Path) -> Result<Vec<DataFolder>> {
    let mut folders = Vec::new();

    for path in sorted_entries(root)? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if name.starts_with('.') || !path.is_dir() || is_dataset(&path) {
            continue;
        }

        let datasets: Vec<PathBuf> = sorted_entries(&path)?.into_iter().filter(|p| is_dataset(p)).collect();
        if datasets.is_empty() {
            debug!(folder = %name, "no datasets");
            continue;
        }
        folders.push(DataFolder { name, path, datasets });
    }

    Ok(folders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_data_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for sub in ["ModelB/tas.zarr", "ModelB/pr.zarr", "ModelA/x.zarr", "Empty", ".hidden/y.zarr", "loose.zarr"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("ModelA/notes.txt"), "").unwrap();

        let folders = scan_data_root(root).unwrap();
        let names: Vec<&str> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ModelA", "ModelB"]);
        assert_eq!(folders[0].datasets, vec![root.join("ModelA/x.zarr")]);
        assert_eq!(
            folders[1].datasets,
            vec![root.join("ModelB/pr.zarr"), root.join("ModelB/tas.zarr")]
        );
        assert_eq!(folders[1].first(), Some(root.join("ModelB/pr.zarr").as_path()));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(scan_data_root(&dir.path().join("nope")).is_err());
    }
}
