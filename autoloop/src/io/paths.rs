//! Canonical paths within `.auto/` and workspace scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::atomic::write_atomic;
use super::config::{AutoConfig, write_config};

/// All canonical paths within `.auto/` for a project root.
#[derive(Debug, Clone)]
pub struct AutoPaths {
    pub root: PathBuf,
    pub auto_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub active_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl AutoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let auto_dir = root.join(".auto");
        let sessions_dir = auto_dir.join("sessions");
        Self {
            root,
            config_path: auto_dir.join("config.toml"),
            gitignore_path: auto_dir.join(".gitignore"),
            active_dir: sessions_dir.join("active"),
            archive_dir: sessions_dir.join("archive"),
            sessions_dir,
            auto_dir,
        }
    }

    /// Resolve a path from configuration relative to the project root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn session(&self, id: &str) -> SessionPaths {
        SessionPaths::new(self.active_dir.join(id))
    }

    pub fn archived_session(&self, id: &str) -> SessionPaths {
        SessionPaths::new(self.archive_dir.join(id))
    }
}

/// Files belonging to one session directory (active or archived).
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub state_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub events_path: PathBuf,
    pub control_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            state_path: dir.join("state.json"),
            checkpoint_path: dir.join("checkpoint.json"),
            events_path: dir.join("events.jsonl"),
            control_path: dir.join("control.json"),
            iterations_dir: dir.join("iterations"),
            dir,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create `.auto/` scaffolding with a default config in `root`.
///
/// Fails if the config already exists unless `options.force` is set. Existing
/// sessions are never touched.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<AutoPaths> {
    let paths = AutoPaths::new(root);
    if paths.auto_dir.exists() && !paths.auto_dir.is_dir() {
        return Err(anyhow!("init: .auto exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [&paths.auto_dir, &paths.active_dir, &paths.archive_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    write_config(&paths.config_path, &AutoConfig::default())?;
    write_atomic(&paths.gitignore_path, AUTO_GITIGNORE)?;
    Ok(paths)
}

const AUTO_GITIGNORE: &str = "sessions/\ncontext_usage.json\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.active_dir.is_dir());
        assert!(paths.archive_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            AUTO_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("load"),
            AutoConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_workspace(temp.path(), &InitOptions { force: true }).expect("force");
    }

    #[test]
    fn session_paths_live_under_active_and_archive() {
        let paths = AutoPaths::new("/project");
        assert_eq!(
            paths.session("auto-1").state_path,
            PathBuf::from("/project/.auto/sessions/active/auto-1/state.json")
        );
        assert_eq!(
            paths.archived_session("auto-1").dir,
            PathBuf::from("/project/.auto/sessions/archive/auto-1")
        );
        assert_eq!(paths.resolve("/abs/file"), PathBuf::from("/abs/file"));
    }
}
