/// Sandbox Paths - host-side staging directories for the active task
///
/// The sandbox is process-local shared state: one task owns it from
/// staging until acknowledgment. It is wiped and recreated at the start of
/// every task and torn down afterwards unless the envelope sets `skip_rm`.

use overseer_common::WorkerConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SandboxPaths {
    pub root: PathBuf,
    pub exec_dir: PathBuf,
    pub out_dir: PathBuf,
    pub container_name: String,
}

impl SandboxPaths {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            root: config.sandbox_root.clone(),
            exec_dir: config.exec_dir(),
            out_dir: config.out_dir(),
            container_name: config.container_name.clone(),
        }
    }

    /// Force-remove and recreate both mounted directories
    pub fn reset(&self) -> io::Result<()> {
        for dir in [&self.exec_dir, &self.out_dir] {
            remove_path(dir)?;
            fs::create_dir_all(dir)?;
        }
        info!(
            exec_dir = %self.exec_dir.display(),
            out_dir = %self.out_dir.display(),
            "Sandbox reset"
        );
        Ok(())
    }

    /// Force-remove everything under the sandbox root
    pub fn teardown(&self) -> io::Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            debug!(path = %path.display(), "Recursively force removing");
            remove_path(&path)?;
        }
        info!(root = %self.root.display(), "Sandbox torn down");
        Ok(())
    }
}

/// `rm -rf` semantics: a missing path is not an error
pub fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_in(root: &Path) -> SandboxPaths {
        let config = WorkerConfig {
            sandbox_root: root.to_path_buf(),
            ..WorkerConfig::default()
        };
        SandboxPaths::from_config(&config)
    }

    #[test]
    fn test_reset_wipes_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path());
        sandbox.reset().unwrap();
        fs::write(sandbox.exec_dir.join("stale.py"), "old").unwrap();
        fs::write(sandbox.out_dir.join("stale.txt"), "old").unwrap();

        sandbox.reset().unwrap();

        assert!(sandbox.exec_dir.is_dir());
        assert!(sandbox.out_dir.is_dir());
        assert_eq!(fs::read_dir(&sandbox.exec_dir).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&sandbox.out_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_teardown_empties_root() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(tmp.path());
        sandbox.reset().unwrap();
        fs::write(sandbox.exec_dir.join("main.py"), "print(1)").unwrap();
        fs::write(tmp.path().join("loose-file"), "x").unwrap();

        sandbox.teardown().unwrap();

        assert!(tmp.path().is_dir());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_teardown_of_missing_root_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = sandbox_in(&tmp.path().join("never-created"));
        assert!(sandbox.teardown().is_ok());
    }

    #[test]
    fn test_remove_path_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, "a").unwrap();
        remove_path(&file).unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());
    }
}
