//! Script file management
//!
//! Writes the scripts of a Reconciler to a private temporary directory so
//! they can be handed to ytt as file inputs. The directory is removed when
//! the [`ScriptDir`] is dropped.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::info;

use crate::crd::Reconciler;
use crate::error::{Error, Result};

/// Materialized scripts of one Reconciler
pub struct ScriptDir {
    dir: TempDir,
    paths: Vec<PathBuf>,
}

impl ScriptDir {
    /// Decode and write every script of the Reconciler
    pub fn materialize(reconciler: &Reconciler) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ytt-operator")
            .tempdir()
            .map_err(|e| Error::bootstrap(format!("Failed to create scripts directory: {}", e)))?;
        Self::write_into(reconciler, dir)
    }

    /// Like [`ScriptDir::materialize`], below a given parent directory
    pub fn materialize_in(reconciler: &Reconciler, parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ytt-operator")
            .tempdir_in(parent)
            .map_err(|e| Error::bootstrap(format!("Failed to create scripts directory: {}", e)))?;
        Self::write_into(reconciler, dir)
    }

    fn write_into(reconciler: &Reconciler, dir: TempDir) -> Result<Self> {
        let mut paths = Vec::with_capacity(reconciler.spec.scripts.len());
        for script in &reconciler.spec.scripts {
            let body = script.decode()?;
            let path = dir.path().join(&script.name);
            write_file(&path, &body)?;
            paths.push(path);
        }

        info!(
            dir = %dir.path().display(),
            scripts = paths.len(),
            "Scripts written"
        );
        Ok(Self { dir, paths })
    }

    /// Script files, in declaration order
    pub fn files(&self) -> &[PathBuf] {
        &self.paths
    }
}

/// Write content to a file
fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| Error::bootstrap(format!("Failed to create file {:?}: {}", path, e)))?;
    file.write_all(content)
        .map_err(|e| Error::bootstrap(format!("Failed to write file {:?}: {}", path, e)))?;
    file.flush()
        .map_err(|e| Error::bootstrap(format!("Failed to flush file {:?}: {}", path, e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::bootstrap(format!("Failed to set permissions on {:?}: {}", path, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReconcilerScript, ReconcilerSpec};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use tempfile::tempdir;

    fn reconciler(scripts: Vec<ReconcilerScript>) -> Reconciler {
        Reconciler::new(
            "demo",
            ReconcilerSpec {
                scripts,
                ..Default::default()
            },
        )
    }

    fn script(name: &str, body: &str) -> ReconcilerScript {
        ReconcilerScript {
            name: name.to_string(),
            encoded: STANDARD.encode(body),
        }
    }

    #[test]
    fn scripts_are_written_in_order() {
        let parent = tempdir().unwrap();
        let r = reconciler(vec![
            script("config.yaml", "#@ load(\"@ytt:data\", \"data\")\n"),
            script("helpers.star", "def name(): return 'x'\n"),
        ]);

        let dir = ScriptDir::materialize_in(&r, parent.path()).unwrap();
        assert_eq!(dir.files().len(), 2);
        assert!(dir.files()[0].ends_with("config.yaml"));
        assert_eq!(
            fs::read_to_string(&dir.files()[1]).unwrap(),
            "def name(): return 'x'\n"
        );
    }

    #[test]
    fn directory_is_removed_on_drop() {
        let parent = tempdir().unwrap();
        let r = reconciler(vec![script("a.yaml", "a: 1\n")]);

        let file;
        {
            let dir = ScriptDir::materialize_in(&r, parent.path()).unwrap();
            file = dir.files()[0].clone();
            assert!(file.exists());
        }
        assert!(!file.exists());
        assert!(!file.parent().unwrap().exists());
    }

    #[test]
    fn undecodable_scripts_fail() {
        let parent = tempdir().unwrap();
        let r = reconciler(vec![ReconcilerScript {
            name: "bad.yaml".to_string(),
            encoded: "not base64!!".to_string(),
        }]);
        assert!(matches!(
            ScriptDir::materialize_in(&r, parent.path()),
            Err(Error::Validation(_))
        ));
    }
}
