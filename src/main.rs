// ABOUTME: Entry point for the dyno-exec CLI application.
// ABOUTME: Parses arguments, resolves the target and dispatches to RemoteAccess.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use dyno_exec::commands::RemoteAccess;
use dyno_exec::config::ExecConfig;
use dyno_exec::error::{Error, Result};
use dyno_exec::types::{AppName, DynoName, Target};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag when set
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if e.is_retryable() {
            eprintln!("This failure may be temporary; try again.");
        }
        std::process::exit(e.exit_status());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let target = resolve_target(&config, cli.app.as_deref(), cli.dyno.as_deref())?;

    match cli.command {
        Commands::Status => {
            let access = RemoteAccess::new(config)?;
            let report = access.get_status(&target).await;
            println!("{report}");
            Ok(())
        }
        Commands::Shell { command } => {
            let access = RemoteAccess::new(config)?;
            let command = (!command.is_empty()).then(|| command.join(" "));
            access.run_shell(&target, command).await
        }
        Commands::Socks { port } => {
            let access = RemoteAccess::new(config)?;
            let tunnel = access.start_socks_proxy(&target, port).await?;
            println!(
                "SOCKS proxy for {} listening on {} (Ctrl-C to stop)",
                target,
                tunnel.local_addr()
            );
            tunnel.run_until_interrupted().await
        }
        Commands::Forward {
            remote_port,
            local_port,
            remote_host,
        } => {
            let access = RemoteAccess::new(config)?;
            let tunnel = access
                .start_port_forward(
                    &target,
                    local_port.unwrap_or(remote_port),
                    &remote_host,
                    remote_port,
                )
                .await?;
            println!(
                "Forwarding {} -> {}:{} on {} (Ctrl-C to stop)",
                tunnel.local_addr(),
                remote_host,
                remote_port,
                target
            );
            tunnel.run_until_interrupted().await
        }
        Commands::Copy {
            remote_path,
            output,
        } => {
            let access = RemoteAccess::new(config)?;
            let local_path = match output {
                Some(path) => path,
                None => default_copy_destination(&remote_path)?,
            };
            let bytes = access.run_copy(&target, &remote_path, &local_path).await?;
            println!("Copied {} bytes to {}", bytes, local_path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ExecConfig> {
    let config = match path {
        Some(path) => ExecConfig::load(path)?,
        None => ExecConfig::discover(&env::current_dir()?)?,
    };
    Ok(config.with_env_overrides())
}

fn resolve_target(config: &ExecConfig, app: Option<&str>, dyno: Option<&str>) -> Result<Target> {
    let app = app.ok_or_else(|| {
        Error::InvalidTarget("no app given; pass --app or set HEROKU_APP".to_string())
    })?;
    let app = AppName::new(app).map_err(|e| Error::InvalidTarget(e.to_string()))?;
    let dyno = match dyno {
        Some(dyno) => DynoName::new(dyno).map_err(|e| Error::InvalidTarget(e.to_string()))?,
        None => config.default_dyno.clone(),
    };
    Ok(Target::new(app, dyno))
}

fn default_copy_destination(remote_path: &str) -> Result<PathBuf> {
    let name = std::path::Path::new(remote_path)
        .file_name()
        .ok_or_else(|| Error::InvalidConfig(format!("cannot derive a local name from {remote_path}")))?;
    Ok(PathBuf::from(name))
}
