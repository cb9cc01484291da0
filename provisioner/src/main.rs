use clap::{Parser, Subcommand};
use provisioner::config::{Mode, ProvisionerConfig, non_blank, vars};
use provisioner::output;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "neon-provisioner", about = "Provision or attach a Neon Postgres topology")]
struct Cli {
    /// Overrides the NEON_MODE environment variable.
    #[command(subcommand)]
    mode: Option<ModeCommand>,
}

#[derive(Subcommand)]
enum ModeCommand {
    /// Require every referenced resource to already exist.
    Attach,
    /// Create missing resources where the per-resource flags allow it.
    Provision,
    /// Suspend a known compute endpoint.
    Suspend,
    /// Resume a known compute endpoint.
    Resume,
}

impl From<ModeCommand> for Mode {
    fn from(command: ModeCommand) -> Self {
        match command {
            ModeCommand::Attach => Mode::Attach,
            ModeCommand::Provision => Mode::Provision,
            ModeCommand::Suspend => Mode::Suspend,
            ModeCommand::Resume => Mode::Resume,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match ProvisionerConfig::from_env(cli.mode.map(Mode::from)) {
        Ok(config) => config,
        Err(error) => {
            let output_file_path =
                non_blank(std::env::var(vars::OUTPUT_FILE_PATH).ok()).map(PathBuf::from);
            output::try_write_failure_artifact(output_file_path.as_deref(), &error);
            eprintln!("Neon provisioner failed: {error}");
            std::process::exit(1);
        }
    };

    std::process::exit(provisioner::run(&config).await);
}
