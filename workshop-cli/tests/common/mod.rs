#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another invocation against the same home.
    pub fn new_cmd(&self) -> Command {
        command_for(self.home.path())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.home.path().join(".noop").join("settings.yaml")
    }
}

fn command_for(home: &Path) -> Command {
    let bin_path = env!("CARGO_BIN_EXE_workshop");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("WORKSHOP_RESOURCES_DIR");
    cmd.arg("--home").arg(home);
    cmd
}

pub fn workshop() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp home");
    TestContext {
        cmd: command_for(home.path()),
        home,
    }
}
