use std::path::{Path, PathBuf};

use workshop_shared::constants::machine;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use crate::backend::BackendKind;

/// Directory structure constants
pub mod dirs {
    /// Base directory name for workshop state
    pub const WORKSHOP_DIR: &str = ".workshop";

    /// Default bundled resources directory under home
    pub const RESOURCES_DIR: &str = "resources";

    /// Per-run boot disks
    pub const DISKS_DIR: &str = "disks";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";

    /// Persistent guest data, wiped only by a reset
    pub const DATA_DIR: &str = "data";

    /// Backend-private state (LIMA_HOME, imported distributions)
    pub const MACHINES_DIR: &str = "machines";

    /// Settings directory
    pub const NOOP_DIR: &str = ".noop";

    pub const SETTINGS_FILE: &str = "settings.yaml";

    /// Bundled tools for the Lima backend
    pub const LIMA_TOOLS_DIR: &str = "lima/bin";
}

/// Locations used by earlier releases, relative to home, and where they live now.
const LEGACY_LOCATIONS: [(&str, &str); 2] = [
    ("settings.yaml", ".noop/settings.yaml"),
    ("lima", "machines"),
];

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

#[derive(Clone, Debug)]
pub struct WorkshopLayout {
    home_dir: PathBuf,
    resources_dir: PathBuf,
}

impl WorkshopLayout {
    pub fn new(home_dir: PathBuf, resources_dir: PathBuf) -> Self {
        Self {
            home_dir,
            resources_dir,
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn resources_dir(&self) -> &Path {
        &self.resources_dir
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::DISKS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    /// Host side of the guest's `/noop/data`.
    pub fn data_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::DATA_DIR)
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::MACHINES_DIR)
    }

    /// `<home>/.noop/settings.yaml`
    pub fn settings_file(&self) -> PathBuf {
        self.home_dir
            .join(dirs::NOOP_DIR)
            .join(dirs::SETTINGS_FILE)
    }

    /// Bundled backend tools, when the resources ship them.
    pub fn tools_dir(&self, kind: BackendKind) -> Option<PathBuf> {
        match kind {
            BackendKind::Lima => {
                let dir = self.resources_dir.join(dirs::LIMA_TOOLS_DIR);
                dir.is_dir().then_some(dir)
            }
            BackendKind::Wsl => None,
        }
    }

    /// Create the directory tree and move state left by earlier releases.
    pub async fn prepare(&self) -> WorkshopResult<()> {
        let layout = self.clone();
        blocking("layout preparation", move || layout.prepare_tree()).await
    }

    fn prepare_tree(&self) -> WorkshopResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| WorkshopError::Storage(format!("failed to create home: {e}")))?;

        self.migrate_legacy()?;

        for dir in [
            self.disks_dir(),
            self.logs_dir(),
            self.data_dir(),
            self.machines_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                WorkshopError::Storage(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    fn migrate_legacy(&self) -> WorkshopResult<()> {
        for (old, new) in LEGACY_LOCATIONS {
            let from = self.home_dir.join(old);
            let to = self.home_dir.join(new);
            if !from.exists() || to.exists() {
                continue;
            }
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&from, &to).map_err(|e| {
                WorkshopError::Storage(format!(
                    "failed to migrate {} to {}: {e}",
                    from.display(),
                    to.display()
                ))
            })?;
            tracing::info!(from = %from.display(), to = %to.display(), "Migrated legacy state");
        }
        Ok(())
    }

    /// Latest bundled base image for this backend and architecture.
    ///
    /// Images are named `noop-workshop-vm[-<version>].<arch>.<ext>`; when
    /// several versions are bundled the lexically greatest wins.
    ///
    /// # Errors
    /// `WorkshopError::PrerequisiteMissing` when no image matches.
    pub async fn base_image(&self, kind: BackendKind, arch: &str) -> WorkshopResult<PathBuf> {
        let layout = self.clone();
        let arch = arch.to_string();
        blocking("base image lookup", move || layout.find_base_image(kind, &arch)).await
    }

    fn find_base_image(&self, kind: BackendKind, arch: &str) -> WorkshopResult<PathBuf> {
        let suffix = format!(".{}.{}", arch, image_extension(kind));
        let entries = std::fs::read_dir(&self.resources_dir).map_err(|e| {
            WorkshopError::PrerequisiteMissing(format!(
                "resources directory {} unreadable: {e}",
                self.resources_dir.display()
            ))
        })?;

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(machine::IMAGE_PREFIX) && name.ends_with(&suffix))
            .max()
            .map(|name| self.resources_dir.join(name))
            .ok_or_else(|| {
                WorkshopError::PrerequisiteMissing(format!(
                    "no {}*{} image in {}",
                    machine::IMAGE_PREFIX,
                    suffix,
                    self.resources_dir.display()
                ))
            })
    }

    /// Where this run's boot disk is copied to.
    pub fn boot_disk_path(&self, name: &str, base_image: &Path) -> PathBuf {
        let file_name = base_image
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "boot.img".into());
        self.disks_dir().join(format!("{}-{}", name, file_name))
    }

    /// Empty the data directory, keeping the directory itself.
    pub async fn wipe_data_dir(&self) -> WorkshopResult<()> {
        let layout = self.clone();
        blocking("data directory wipe", move || layout.wipe_data()).await
    }

    fn wipe_data(&self) -> WorkshopResult<()> {
        let data = self.data_dir();
        match std::fs::remove_dir_all(&data) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(WorkshopError::Storage(format!(
                    "failed to wipe {}: {e}",
                    data.display()
                )));
            }
        }
        std::fs::create_dir_all(&data)
            .map_err(|e| WorkshopError::Storage(format!("failed to recreate data dir: {e}")))?;
        tracing::info!(dir = %data.display(), "Data directory wiped");
        Ok(())
    }
}

/// Run filesystem work off the async workers.
async fn blocking<T, F>(what: &'static str, work: F) -> WorkshopResult<T>
where
    F: FnOnce() -> WorkshopResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| WorkshopError::Internal(format!("{what} panicked: {e}")))?
}

fn image_extension(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Lima => "qcow2",
        BackendKind::Wsl => "vhdx",
    }
}

/// Guest architecture name as used in image file names.
pub fn guest_arch() -> &'static str {
    std::env::consts::ARCH
}

/// A per-run copy of the base image. Released on stop.
#[derive(Debug)]
pub struct BootDisk {
    path: PathBuf,
}

impl BootDisk {
    /// Copy `base` to `target`, sharing extents where the filesystem allows.
    pub async fn prepare(base: &Path, target: PathBuf) -> WorkshopResult<Self> {
        let base = base.to_path_buf();
        let path = target.clone();
        tokio::task::spawn_blocking(move || -> WorkshopResult<()> {
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            reflink_copy::reflink_or_copy(&base, &target).map_err(|e| {
                WorkshopError::Storage(format!(
                    "failed to copy {} to {}: {e}",
                    base.display(),
                    target.display()
                ))
            })?;
            Ok(())
        })
        .await
        .map_err(|e| WorkshopError::Internal(format!("boot disk copy panicked: {e}")))??;

        tracing::debug!(disk = %path.display(), "Boot disk prepared");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the copy.
    pub async fn release(self) -> WorkshopResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(disk = %self.path.display(), "Boot disk released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkshopError::Storage(format!(
                "failed to release boot disk {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(dir: &TempDir) -> WorkshopLayout {
        WorkshopLayout::new(dir.path().join("home"), dir.path().join("resources"))
    }

    #[tokio::test]
    async fn test_prepare_creates_tree() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        layout.prepare().await.unwrap();

        assert!(layout.disks_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.data_dir().is_dir());
        assert!(layout.machines_dir().is_dir());
        assert_eq!(
            layout.settings_file(),
            dir.path().join("home/.noop/settings.yaml")
        );
    }

    #[tokio::test]
    async fn test_prepare_migrates_legacy_settings() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        std::fs::create_dir_all(layout.home_dir()).unwrap();
        std::fs::write(layout.home_dir().join("settings.yaml"), "a: 1\n").unwrap();

        layout.prepare().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(layout.settings_file()).unwrap(),
            "a: 1\n"
        );
        assert!(!layout.home_dir().join("settings.yaml").exists());
    }

    #[tokio::test]
    async fn test_base_image_picks_latest_matching() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        let resources = layout.resources_dir().to_path_buf();
        std::fs::create_dir_all(&resources).unwrap();
        for name in [
            "noop-workshop-vm-1.0.0.aarch64.qcow2",
            "noop-workshop-vm-1.2.0.aarch64.qcow2",
            "noop-workshop-vm-1.3.0.x86_64.qcow2",
            "other.aarch64.qcow2",
        ] {
            std::fs::write(resources.join(name), b"img").unwrap();
        }

        let image = layout.base_image(BackendKind::Lima, "aarch64").await.unwrap();
        assert_eq!(
            image.file_name().unwrap(),
            "noop-workshop-vm-1.2.0.aarch64.qcow2"
        );
        assert!(matches!(
            layout.base_image(BackendKind::Wsl, "aarch64").await,
            Err(WorkshopError::PrerequisiteMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_resources_is_prerequisite_error() {
        let dir = TempDir::new().unwrap();
        let err = layout(&dir)
            .base_image(BackendKind::Lima, "aarch64")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkshopError::PrerequisiteMissing(_)));
    }

    #[tokio::test]
    async fn test_wipe_data_dir() {
        let dir = TempDir::new().unwrap();
        let layout = layout(&dir);
        layout.prepare().await.unwrap();
        std::fs::write(layout.data_dir().join("db.sqlite"), b"x").unwrap();

        layout.wipe_data_dir().await.unwrap();
        assert!(layout.data_dir().is_dir());
        assert_eq!(std::fs::read_dir(layout.data_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_boot_disk_copy_and_release() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.qcow2");
        std::fs::write(&base, b"base image").unwrap();
        let target = dir.path().join("boot.qcow2");
        std::fs::write(&target, b"stale").unwrap();

        let disk = BootDisk::prepare(&base, target.clone()).await.unwrap();
        assert_eq!(std::fs::read(disk.path()).unwrap(), b"base image");

        disk.release().await.unwrap();
        assert!(!target.exists());
    }
}
