// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use glint::{path::default_config_dir, service::Service};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "glint [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Use alternate configuration directory.
    #[arg(short, long, global = true, value_name = "path")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config_dir = match self.config_dir {
            Some(path) => path,
            None => default_config_dir()?,
        };
        let service = Service::open(config_dir).await?;

        match self.command {
            Command::Run => run_daemon(service).await,
            Command::Add(opts) => run_add(service, opts).await,
            Command::Remove(opts) => run_remove(service, opts).await,
            Command::List => run_list(service).await,
            Command::Clone(opts) => run_clone(service, opts).await,
            Command::Pull => run_pull(service).await,
            Command::Push => run_push(service).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Watch monitored directories and keep them in sync until interrupted.
    #[command(override_usage = "glint run [options]")]
    Run,

    /// Start monitoring a directory.
    #[command(override_usage = "glint add [options] <path>")]
    Add(AddOptions),

    /// Stop monitoring a directory.
    #[command(override_usage = "glint remove [options] <path>...")]
    Remove(RemoveOptions),

    /// List monitored directories.
    #[command(override_usage = "glint list [options]")]
    List,

    /// Clone remote repository and start monitoring it.
    #[command(override_usage = "glint clone [options] <url> [<parent>]")]
    Clone(CloneOptions),

    /// Pull every monitored directory once.
    #[command(override_usage = "glint pull [options]")]
    Pull,

    /// Commit and push every monitored directory once.
    #[command(override_usage = "glint push [options]")]
    Push,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct AddOptions {
    /// Directory to monitor, which must be a Git work tree with a remote.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Directories to stop monitoring.
    #[arg(required = true, value_name = "path")]
    pub paths: Vec<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CloneOptions {
    /// URL of remote to clone from.
    #[arg(required = true, value_name = "url")]
    pub url: String,

    /// Directory to clone into, defaults to the current directory.
    #[arg(value_name = "parent")]
    pub parent: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

async fn run_daemon(service: Service) -> Result<()> {
    if service.directories().await.is_empty() {
        warn!("no monitored directories, use `glint add` to add some");
    }

    service
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                error!("cannot listen for interrupt: {error}");
            }
        })
        .await?;

    Ok(())
}

async fn run_add(service: Service, opts: AddOptions) -> Result<()> {
    let path = service.add_directory(opts.path).await?;
    info!("monitoring {}", path.display());

    Ok(())
}

async fn run_remove(service: Service, opts: RemoveOptions) -> Result<()> {
    for path in opts.paths {
        let path = service.remove_directory(path).await?;
        info!("stopped monitoring {}", path.display());
    }

    Ok(())
}

async fn run_list(service: Service) -> Result<()> {
    for handle in service.handles().await {
        println!("{}", handle.path().display());
    }

    Ok(())
}

async fn run_clone(service: Service, opts: CloneOptions) -> Result<()> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} {elapsed_precise:.green}  {msg}",
    )?);
    bar.set_message(opts.url.clone());
    bar.enable_steady_tick(Duration::from_millis(100));

    let parent = opts.parent.unwrap_or_else(|| PathBuf::from("."));
    let sink = bar.clone();
    let result = service
        .clone_repository(&opts.url, parent, move |line| sink.set_message(line.to_string()))
        .await;
    bar.finish_and_clear();

    let path = result?;
    info!("cloned {} into {}", opts.url, path.display());

    Ok(())
}

async fn run_pull(service: Service) -> Result<()> {
    let mut failed = 0;
    for (path, result) in service.pull_all().await {
        match result {
            Ok(()) => info!("pulled {}", path.display()),
            Err(error) => {
                warn!("{error}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} director(ies) failed to pull");
    }

    Ok(())
}

async fn run_push(service: Service) -> Result<()> {
    let mut failed = 0;
    for (path, result) in service.push_all().await {
        match result {
            Ok(report) => info!(
                "pushed {} ({:?}, {:?})",
                path.display(),
                report.commit,
                report.push
            ),
            Err(error) => {
                warn!("{error}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} director(ies) failed to push");
    }

    Ok(())
}
