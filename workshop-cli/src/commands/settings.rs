use clap::{Args, Subcommand};
use workshop::settings::{FileSettings, SettingsStore};

use crate::cli::{GlobalFlags, init_stderr_logging};

#[derive(Args, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub action: SettingsAction,
}

#[derive(Subcommand, Debug)]
pub enum SettingsAction {
    /// Print a setting
    Get { key: String },

    /// Store a setting
    Set { key: String, value: String },

    /// Remove a setting
    Delete { key: String },
}

pub async fn execute(args: SettingsArgs, global: &GlobalFlags) -> anyhow::Result<()> {
    init_stderr_logging();
    let settings = FileSettings::new(global.options().layout().settings_file());

    match args.action {
        SettingsAction::Get { key } => match settings.get(&key).await? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("setting '{}' is not set", key),
        },
        SettingsAction::Set { key, value } => settings.set(&key, &value).await?,
        SettingsAction::Delete { key } => settings.delete(&key).await?,
    }
    Ok(())
}
