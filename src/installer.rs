//! Copies `install=true` artifacts into a staged install root with
//! conflict detection.
//!
//! Recursive copying is done with `fs_extra::dir` rather than a hand-rolled
//! `walkdir` + `fs::copy` loop. Target paths are rebased lexically and any
//! path that would land outside the install root is refused.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{error::BuildError, util::display_path};

/// One artifact to be installed, as seen by the installer.
#[derive(Debug, Clone)]
pub struct InstallArtifact {
    /// Absolute path of the file on disk.
    pub source: PathBuf,
    /// `installPrefix` for this artifact (often product-specific).
    pub install_prefix: PathBuf,
    /// `installDir` for this artifact (e.g. `bin`, `lib`).
    pub install_dir: PathBuf,
    /// Path relative to the configured install-source base, if the
    /// artifact's directory structure should be preserved under
    /// `install_dir`; `None` means install flat, using the basename.
    pub source_relative_to_install_base: Option<PathBuf>,
}

impl InstallArtifact {
    fn target_relative(&self) -> PathBuf {
        let leaf = match &self.source_relative_to_install_base {
            Some(rel) => rel.clone(),
            None => PathBuf::from(self.source.file_name().unwrap_or_default()),
        };
        self.install_prefix.join(&self.install_dir).join(leaf)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallerConfig {
    pub install_root: PathBuf,
    pub remove_existing_installation: bool,
    pub dry_run: bool,
    pub keep_going: bool,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    /// (source, target) pairs that were (or, in a dry run, would be)
    /// copied.
    pub installed: Vec<(PathBuf, PathBuf)>,
}

pub struct Installer {
    config: InstallerConfig,
}

impl Installer {
    pub fn new(config: InstallerConfig) -> Self {
        Self { config }
    }

    /// Installs every artifact, refusing any target that would resolve
    /// outside `installRoot` and failing with [`BuildError::InstallConflict`]
    /// when two distinct sources map to the same target.
    ///
    /// With `removeExistingInstallation`, `installRoot` is recursively
    /// deleted first — refusing to do so if it resolves to `/` or the
    /// user's home directory.
    pub fn install(&self, artifacts: &[InstallArtifact]) -> Result<InstallReport, BuildError> {
        let mut targets: BTreeMap<PathBuf, PathBuf> = BTreeMap::new(); // target -> source
        let mut resolved: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let target = self.resolve_target(artifact)?;
            if let Some(existing_source) = targets.get(&target) {
                if existing_source != &artifact.source {
                    let err = BuildError::InstallConflict {
                        source_a: existing_source.clone(),
                        source_b: artifact.source.clone(),
                        target: target.clone(),
                    };
                    if self.config.keep_going {
                        tracing::error!(target: "build_graph_core::installer", "{err}");
                        continue;
                    }
                    return Err(err);
                }
                // Same source installed twice: not a conflict.
                continue;
            }
            targets.insert(target.clone(), artifact.source.clone());
            resolved.push((artifact.source.clone(), target));
        }

        if self.config.remove_existing_installation {
            self.remove_install_root()?;
        }

        if !self.config.dry_run {
            for (source, target) in &resolved {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(source, target)?;
            }
        }

        Ok(InstallReport { installed: resolved })
    }

    /// Computes `installRoot / installPrefix / installDir / leaf`, refusing
    /// any result that would lexically escape `installRoot`.
    fn resolve_target(&self, artifact: &InstallArtifact) -> Result<PathBuf, BuildError> {
        let relative = artifact.target_relative();
        let joined = self.config.install_root.join(&relative);
        let normalized = lexically_normalize(&joined);
        let root_normalized = lexically_normalize(&self.config.install_root);
        if !normalized.starts_with(&root_normalized) {
            return Err(BuildError::msg(format!(
                "install target {} escapes install root {}",
                display_path(&normalized).display(),
                display_path(&root_normalized).display()
            )));
        }
        Ok(normalized)
    }

    fn remove_install_root(&self) -> Result<(), BuildError> {
        let root = lexically_normalize(&self.config.install_root);
        if root == Path::new("/") {
            return Err(BuildError::msg("refusing to remove install root: resolves to /"));
        }
        if let Some(home) = home::home_dir() {
            if root == lexically_normalize(&home) {
                return Err(BuildError::msg("refusing to remove install root: resolves to the home directory"));
            }
        }
        if self.config.dry_run {
            return Ok(());
        }
        if root.exists() {
            fs_extra::dir::remove(&root).map_err(|e| BuildError::msg(e.to_string()))?;
        }
        Ok(())
    }
}

/// Lexical (no filesystem access) `.`/`..` normalization, so that escape
/// checks work even for paths that don't exist yet on disk.
fn lexically_normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(source: &str, dir: &str) -> InstallArtifact {
        InstallArtifact {
            source: PathBuf::from(source),
            install_prefix: PathBuf::new(),
            install_dir: PathBuf::from(dir),
            source_relative_to_install_base: None,
        }
    }

    #[test]
    fn distinct_sources_to_one_target_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.out"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/a.out"), b"b").unwrap();

        let installer = Installer::new(InstallerConfig {
            install_root: dir.path().join("root"),
            dry_run: true,
            ..Default::default()
        });

        let artifacts = vec![
            artifact(dir.path().join("a.out").to_str().unwrap(), "bin"),
            artifact(dir.path().join("lib/a.out").to_str().unwrap(), "bin"),
        ];
        let err = installer.install(&artifacts).unwrap_err();
        assert!(matches!(err, BuildError::InstallConflict { .. }));
    }

    #[test]
    fn same_source_installed_twice_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(InstallerConfig {
            install_root: dir.path().join("root"),
            dry_run: true,
            ..Default::default()
        });
        let a = artifact(dir.path().join("a.out").to_str().unwrap(), "bin");
        let artifacts = vec![a.clone(), a];
        let report = installer.install(&artifacts).unwrap();
        assert_eq!(report.installed.len(), 1);
    }

    #[test]
    fn escaping_targets_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let installer = Installer::new(InstallerConfig {
            install_root: dir.path().join("root"),
            dry_run: true,
            ..Default::default()
        });
        let mut a = artifact("/etc/passwd", "bin");
        a.source_relative_to_install_base = Some(PathBuf::from("../../etc/passwd"));
        let err = installer.install(&[a]).unwrap_err();
        assert!(matches!(err, BuildError::Message(_)));
    }

    #[test]
    fn refuses_to_remove_root_directory() {
        let installer = Installer::new(InstallerConfig {
            install_root: PathBuf::from("/"),
            remove_existing_installation: true,
            dry_run: false,
            ..Default::default()
        });
        let err = installer.install(&[]).unwrap_err();
        assert!(matches!(err, BuildError::Message(_)));
    }
}
