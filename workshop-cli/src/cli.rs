use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use workshop::runtime::layout::dirs;
use workshop::runtime::options::envs;
use workshop::{BackendKind, LifecycleController, WorkshopOptions};

use crate::commands::{relay::RelayArgs, run::RunArgs, settings::SettingsArgs};
use crate::prompt::TerminalPrompter;

#[derive(Parser, Debug)]
#[command(name = "workshop", version, about = "Run the local workshop VM")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Boot the workshop VM and keep it running until interrupted
    Run(RunArgs),

    /// Run only the traffic relay
    Relay(RelayArgs),

    /// Read or change persisted settings
    Settings(SettingsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Workshop state directory
    #[arg(long, global = true, env = envs::WORKSHOP_HOME)]
    pub home: Option<PathBuf>,

    /// Directory holding the bundled base images and tools
    #[arg(long, global = true, env = envs::WORKSHOP_RESOURCES_DIR)]
    pub resources: Option<PathBuf>,

    /// VM backend (lima, wsl); defaults to the host's native one
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Name of the machine instance
    #[arg(long, global = true)]
    pub machine: Option<String>,
}

impl GlobalFlags {
    pub fn options(&self) -> WorkshopOptions {
        let mut options = WorkshopOptions::default();
        if let Some(home) = &self.home {
            options.home_dir = home.clone();
            options.resources_dir = home.join(dirs::RESOURCES_DIR);
        }
        if let Some(resources) = &self.resources {
            options.resources_dir = resources.clone();
        }
        if let Some(backend) = self.backend {
            options.backend = backend;
        }
        if let Some(machine) = &self.machine {
            options.machine_name = machine.clone();
        }
        options
    }

    pub fn create_controller(&self, options: &WorkshopOptions) -> anyhow::Result<LifecycleController> {
        Ok(LifecycleController::from_options(options, Arc::new(TerminalPrompter))?)
    }
}

/// Terminal-only logging for short commands.
pub fn init_stderr_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
