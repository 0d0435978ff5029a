//! CLI definition and dispatch.

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::commands;

#[derive(Parser, Debug)]
#[command(
    name = "sealroot",
    version,
    about = "Provision a dm-verity verified-boot chain on a disk image"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the provisioning pipeline over a disk image
    Provision(commands::provision::ProvisionArgs),
}

impl Cli {
    /// Dispatch to the subcommand; returns the process exit code.
    pub async fn run(self) -> anyhow::Result<u8> {
        match self.command {
            Command::Provision(args) => commands::provision::execute(args).await,
        }
    }
}

/// Logging goes to stderr so `--json` output stays clean on stdout.
/// `RUST_LOG` overrides the verbosity flags.
pub fn init_tracing(global: &GlobalFlags) {
    let default_level = match global.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
