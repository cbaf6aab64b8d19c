use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use docket_config::{ConfigFile, SyncConfig};
use eyre::Result as EyreResult;

mod init;
mod scenario;

use init::InitCommand;
use scenario::ScenarioCommand;

pub const EXAMPLES: &str = r"
  # Write a docket.toml with default tunables
  $ docket-sim --home data/ init

  # Close ticket #42 and have the server reject it
  $ docket-sim scenario close-ticket --reject

  # Assign five tickets at once, failing #3
  $ docket-sim scenario bulk-assign --count 5 --fail 3

  # Lose the push channel and watch the views converge again
  $ docket-sim scenario reconnect
";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(after_help = format!(
    "Environment variables:\n  DOCKET_HOME    Directory holding docket.toml\n\nExamples:{EXAMPLES}"
))]
pub struct RootCommand {
    #[command(flatten)]
    pub args: RootArgs,

    #[command(subcommand)]
    pub action: SubCommands,
}

#[derive(Debug, Subcommand)]
pub enum SubCommands {
    Init(InitCommand),
    #[command(alias = "run")]
    Scenario(ScenarioCommand),
}

#[derive(Debug, Parser)]
pub struct RootArgs {
    /// Directory holding docket.toml
    #[arg(long, value_name = "PATH", default_value = ".")]
    #[arg(env = "DOCKET_HOME", hide_env_values = true)]
    pub home: Utf8PathBuf,
}

impl RootArgs {
    /// Tunables from `docket.toml` in the home directory, or the defaults
    /// when there is none.
    pub fn sync_config(&self) -> EyreResult<SyncConfig> {
        if !ConfigFile::exists(&self.home) {
            return Ok(SyncConfig::default());
        }
        Ok(ConfigFile::load(&self.home)?.sync)
    }
}

impl RootCommand {
    pub async fn run(self) -> EyreResult<()> {
        match self.action {
            SubCommands::Init(init) => init.run(&self.args),
            SubCommands::Scenario(scenario) => scenario.run(&self.args).await,
        }
    }
}
