mod cli;
mod commands;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.global.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(commands::EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let mut session = commands::session(&cli.global).await?;

    match cli.command {
        Command::Plan { dir, out, refresh, json } => {
            commands::plan(&session, dir, out, refresh, json).await
        }
        Command::Apply { dir, plan, refresh, json } => {
            commands::apply(&session, dir, plan, refresh, json).await
        }
        Command::Destroy { yes, refresh } => commands::destroy(&session, yes, refresh).await,
        Command::Workspace { command } => commands::workspace(&mut session, command).await,
        Command::ForceUnlock { lock_id } => commands::force_unlock(&session, lock_id).await,
        Command::Graph { dir, output } => commands::graph(&session, dir, output).await,
        Command::State { command } => commands::state(&session, command).await,
    }
}
