use std::fs::create_dir_all;

use clap::Parser;
use docket_config::{ConfigFile, SyncConfig, CONFIG_FILE};
use eyre::{bail, Result as EyreResult, WrapErr};
use tracing::info;

use super::RootArgs;

/// Write a configuration file with default tunables
#[derive(Debug, Parser)]
pub struct InitCommand {
    /// Overwrite an existing configuration
    #[arg(long)]
    pub force: bool,

    /// Prefetches allowed in flight at once
    #[arg(long, value_name = "COUNT")]
    pub prefetch_max_concurrent: Option<usize>,

    /// Failed connection attempts before going offline
    #[arg(long, value_name = "COUNT")]
    pub reconnect_max_attempts: Option<u32>,
}

impl InitCommand {
    pub fn run(self, root_args: &RootArgs) -> EyreResult<()> {
        let home = &root_args.home;

        if ConfigFile::exists(home) && !self.force {
            bail!("{CONFIG_FILE} already exists in {home:?}, pass --force to overwrite it");
        }

        create_dir_all(home).wrap_err_with(|| format!("failed to create {home:?}"))?;

        let mut sync = SyncConfig::default();
        if let Some(max_concurrent) = self.prefetch_max_concurrent {
            sync.prefetch.max_concurrent = max_concurrent;
        }
        if let Some(max_attempts) = self.reconnect_max_attempts {
            sync.reconnect.max_attempts = max_attempts;
        }
        sync.validate()?;

        ConfigFile::new(sync).save(home)?;

        info!(path = %home.join(CONFIG_FILE), "Wrote configuration");

        Ok(())
    }
}
