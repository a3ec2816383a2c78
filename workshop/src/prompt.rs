//! User dialogs and mount directory validation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use workshop_shared::errors::WorkshopResult;

/// Dialogs the controller needs from the UI layer.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Ask for a directory. `Ok(None)` means the user cancelled.
    async fn select_directory(
        &self,
        message: &str,
        default: Option<&Path>,
    ) -> WorkshopResult<Option<PathBuf>>;

    /// Yes/no question.
    async fn confirm(&self, message: &str) -> WorkshopResult<bool>;

    /// Report a fatal problem to the user.
    async fn show_error(&self, title: &str, message: &str);
}

/// Why a candidate mount directory was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidMountDir {
    Missing,
    NotADirectory,
    OutOfScope { scope: PathBuf },
}

impl std::fmt::Display for InvalidMountDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidMountDir::Missing => f.write_str("the directory does not exist"),
            InvalidMountDir::NotADirectory => f.write_str("the path is not a directory"),
            InvalidMountDir::OutOfScope { scope } => {
                write!(f, "the directory must be inside {}", scope.display())
            }
        }
    }
}

/// Where the projects directory may live.
#[derive(Debug, Clone)]
pub struct MountScope {
    root: PathBuf,
}

impl MountScope {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The user's home directory, or the filesystem root when unknown.
    pub fn user_home() -> Self {
        Self::new(dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical form of `candidate` if it is an existing directory in scope.
    pub fn validate(&self, candidate: &Path) -> Result<PathBuf, InvalidMountDir> {
        let resolved = std::fs::canonicalize(candidate).map_err(|_| InvalidMountDir::Missing)?;
        if !resolved.is_dir() {
            return Err(InvalidMountDir::NotADirectory);
        }
        let root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        if !resolved.starts_with(&root) {
            return Err(InvalidMountDir::OutOfScope { scope: root });
        }
        Ok(resolved)
    }
}
