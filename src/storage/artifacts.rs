//! Harvest files a tool left in its workspace

use chrono::{DateTime, Utc};
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::workspace::{ARGS_FILE, ENTRY_FILE};
use crate::result::Artifact;

/// Artifacts plus the non-fatal problems met while collecting them
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Collection {
    pub artifacts: Vec<Artifact>,
    pub warnings: Vec<String>,
}

/// Walks a workspace and records every regular file
#[derive(Debug, Clone, Default)]
pub struct ArtifactCollector {
    export_dir: Option<PathBuf>,
}

impl ArtifactCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy each artifact to `<dir>/<instance-id>/<relative path>`
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    /// Collect from `workspace`. Never fails; problems become warnings.
    pub fn collect(&self, workspace: &Path, instance_id: &str) -> Collection {
        let mut collection = Collection::default();

        for entry in WalkDir::new(workspace).follow_links(false).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    collection.warn(format!("skipped unreadable entry: {}", e));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(workspace) else {
                continue;
            };
            if is_bootstrap(relative) {
                continue;
            }

            match describe(entry.path(), relative) {
                Ok(artifact) => collection.artifacts.push(artifact),
                Err(e) => collection.warn(format!(
                    "skipped unreadable file {}: {}",
                    relative.display(),
                    e
                )),
            }
        }

        collection.artifacts.sort_by(|a, b| a.path.cmp(&b.path));

        if let Some(export_dir) = &self.export_dir {
            let target_root = export_dir.join(instance_id);
            for artifact in &mut collection.artifacts {
                let target = target_root.join(&artifact.path);
                match export(&workspace.join(&artifact.path), &target) {
                    Ok(()) => artifact.exported_to = Some(target),
                    Err(e) => collection.warnings.push(format!(
                        "export of {} failed: {}",
                        artifact.path.display(),
                        e
                    )),
                }
            }
        }

        collection
    }
}

impl Collection {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

fn is_bootstrap(relative: &Path) -> bool {
    relative == Path::new(ENTRY_FILE) || relative == Path::new(ARGS_FILE)
}

fn describe(path: &Path, relative: &Path) -> std::io::Result<Artifact> {
    // Opening proves readability; metadata alone does not
    let file = fs::File::open(path)?;
    let metadata = file.metadata()?;
    Ok(Artifact {
        name: relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: relative.to_path_buf(),
        size: metadata.len(),
        created: metadata.created().ok().map(DateTime::<Utc>::from),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        exported_to: None,
    })
}

fn export(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_regular_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "bb").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/a.txt"), "a").unwrap();
        fs::write(dir.path().join("a.csv"), vec![b'x'; 123]).unwrap();

        let collection = ArtifactCollector::new().collect(dir.path(), "i");
        let paths: Vec<_> = collection
            .artifacts
            .iter()
            .map(|a| a.path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, vec!["a.csv", "b.txt", "sub/a.txt"]);
        assert_eq!(collection.artifacts[0].size, 123);
        assert_eq!(collection.artifacts[2].name, "a.txt");
        assert!(collection.artifacts[0].modified.is_some());
        assert!(collection.warnings.is_empty());
    }

    #[test]
    fn bootstrap_files_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ENTRY_FILE), "echo").unwrap();
        fs::write(dir.path().join(ARGS_FILE), "{}").unwrap();
        fs::write(dir.path().join("out.csv"), "1").unwrap();

        let collection = ArtifactCollector::new().collect(dir.path(), "i");
        assert_eq!(collection.artifacts.len(), 1);
        assert_eq!(collection.artifacts[0].name, "out.csv");
    }

    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join("leak")).unwrap();
        let collection = ArtifactCollector::new().collect(dir.path(), "i");
        assert!(collection.artifacts.is_empty());
    }

    #[test]
    fn empty_workspace_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let collection = ArtifactCollector::new().collect(dir.path(), "i");
        assert!(collection.artifacts.is_empty());
        assert!(collection.warnings.is_empty());
    }

    #[test]
    fn exports_under_instance_id() {
        let dir = tempfile::tempdir().unwrap();
        let export = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("reports")).unwrap();
        fs::write(dir.path().join("reports/r.txt"), "report").unwrap();

        let collection = ArtifactCollector::new()
            .with_export_dir(export.path())
            .collect(dir.path(), "inst-1");

        let expected = export.path().join("inst-1/reports/r.txt");
        assert_eq!(collection.artifacts[0].exported_to.as_deref(), Some(expected.as_path()));
        assert_eq!(fs::read_to_string(expected).unwrap(), "report");
    }
}
