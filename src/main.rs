//! oxidesftp - headless front end for the background context

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use oxidesftp_lib::config::{ConfigStorage, StorageError};
use oxidesftp_lib::sftp::{SftpError, TransferDirection, TransferJobInfo, TransferState};
use oxidesftp_lib::ssh::{AuthMode, ConnectTarget, SshError};
use oxidesftp_lib::{init_logging, BackgroundContext};

const PASSWORD_ENV: &str = "OXIDESFTP_PASSWORD";

#[derive(Parser)]
#[command(name = "oxidesftp")]
#[command(version)]
#[command(about = "Pooled SFTP transfers and edit-in-place remote files")]
struct Cli {
    /// SSH port
    #[arg(short, long, global = true, default_value = "22")]
    port: u16,

    /// Authentication methods to try
    #[arg(long, global = true, value_enum, default_value_t = AuthArg::Auto)]
    auth: AuthArg,

    /// Config file (default: ~/.oxidesftp/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    Ls {
        /// user@host:path
        remote: String,
    },
    /// Download files or directories
    Get {
        /// user@host:path
        remote: String,

        /// Local target directory (default: current directory)
        local: Option<PathBuf>,
    },
    /// Upload files or directories
    Put {
        /// user@host:dir
        remote: String,

        /// Local files, directories or file:// URIs
        #[arg(required = true)]
        sources: Vec<String>,
    },
    /// Edit a remote file locally; saves are uploaded until Ctrl-C
    Edit {
        /// user@host:path
        remote: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AuthArg {
    Auto,
    Key,
    Password,
    Interactive,
}

impl From<AuthArg> for AuthMode {
    fn from(arg: AuthArg) -> Self {
        match arg {
            AuthArg::Auto => AuthMode::Auto,
            AuthArg::Key => AuthMode::PublicKey,
            AuthArg::Password => AuthMode::Password,
            AuthArg::Interactive => AuthMode::KeyboardInteractive,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Invalid remote '{0}', expected user@host:path")]
    InvalidRemote(String),

    #[error("Config error: {0}")]
    Config(#[from] StorageError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error("{0} transfer(s) failed")]
    TransfersFailed(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let storage = match &cli.config {
        Some(path) => ConfigStorage::with_path(path.clone()),
        None => ConfigStorage::new()?,
    };
    let config = storage.load().await?;
    let ctx = BackgroundContext::with_defaults(config);

    let result = match &cli.command {
        Commands::Ls { remote } => ls(&ctx, &cli, remote).await,
        Commands::Get { remote, local } => get(&ctx, &cli, remote, local.as_deref()).await,
        Commands::Put { remote, sources } => put(&ctx, &cli, remote, sources).await,
        Commands::Edit { remote } => edit(&ctx, &cli, remote).await,
    };

    ctx.shutdown().await;
    result
}

fn target_for(cli: &Cli, user: &str, host: &str) -> ConnectTarget {
    ConnectTarget::new(host, user)
        .with_port(cli.port)
        .with_auth(cli.auth.into())
        .with_credential(std::env::var(PASSWORD_ENV).unwrap_or_default())
}

async fn ls(ctx: &BackgroundContext, cli: &Cli, remote: &str) -> Result<(), CliError> {
    let (user, host, path) = parse_remote(remote)?;
    let handle = ctx.connect(target_for(cli, &user, &host)).await?;

    let result = handle.change_dir(&path).await;
    if let Ok(cwd) = &result {
        println!("{}:", cwd);
        for entry in handle.listing() {
            let marker = if entry.is_dir() { "/" } else { "" };
            println!("{:>4} {:>12}  {}{}", entry.permissions, entry.size, entry.name, marker);
        }
    }

    handle.release().await;
    result.map(|_| ()).map_err(CliError::from)
}

async fn get(
    ctx: &BackgroundContext,
    cli: &Cli,
    remote: &str,
    local: Option<&std::path::Path>,
) -> Result<(), CliError> {
    let (user, host, path) = parse_remote(remote)?;
    let handle = ctx.connect(target_for(cli, &user, &host)).await?;

    let target_dir = local.map(|p| p.display().to_string());
    let result = run_jobs(
        ctx,
        TransferDirection::Download,
        &[path],
        &handle,
        target_dir.as_deref(),
    )
    .await;

    handle.release().await;
    result
}

async fn put(
    ctx: &BackgroundContext,
    cli: &Cli,
    remote: &str,
    sources: &[String],
) -> Result<(), CliError> {
    let (user, host, path) = parse_remote(remote)?;
    let handle = ctx.connect(target_for(cli, &user, &host)).await?;

    let result = run_jobs(ctx, TransferDirection::Upload, sources, &handle, Some(&path)).await;

    handle.release().await;
    result
}

async fn run_jobs(
    ctx: &BackgroundContext,
    direction: TransferDirection,
    files: &[String],
    session: &oxidesftp_lib::ssh::Session,
    target_dir: Option<&str>,
) -> Result<(), CliError> {
    let ids = ctx.enqueue(direction, files, session, target_dir)?;
    ctx.queue().wait_idle().await;

    let jobs: Vec<TransferJobInfo> = ids.iter().filter_map(|id| ctx.queue().find(*id)).collect();
    let failed = jobs
        .iter()
        .filter(|job| job.state != TransferState::Completed)
        .count();
    for job in &jobs {
        match &job.error {
            Some(message) => println!("{} -> {}: {}", job.source, job.destination, message),
            None => println!(
                "{} -> {}: {} bytes",
                job.source, job.destination, job.transferred_bytes
            ),
        }
    }

    if failed > 0 {
        return Err(CliError::TransfersFailed(failed));
    }
    Ok(())
}

async fn edit(ctx: &BackgroundContext, cli: &Cli, remote: &str) -> Result<(), CliError> {
    let (user, host, path) = parse_remote(remote)?;
    let handle = ctx.connect(target_for(cli, &user, &host)).await?;

    let result = match ctx.open_mirror(&handle, &path).await {
        Ok(info) => {
            println!("Editing {} as {}", info.remote_path, info.local_path.display());
            println!("Saves are uploaded automatically. Press Ctrl-C to stop.");
            ctx.start_heartbeat();
            let signal = tokio::signal::ctrl_c().await;
            info!(
                "Stopping, {} upload(s) this session",
                ctx.mirrors().upload_count()
            );
            signal.map_err(CliError::from)
        }
        Err(e) => Err(CliError::from(e)),
    };

    handle.release().await;
    result
}

/// Split `user@host:path`. An empty path means the remote home directory.
fn parse_remote(remote: &str) -> Result<(String, String, String), CliError> {
    let invalid = || CliError::InvalidRemote(remote.to_string());

    let at_pos = remote.find('@').ok_or_else(invalid)?;
    let user = &remote[..at_pos];
    let rest = &remote[at_pos + 1..];

    let colon_pos = rest.find(':').ok_or_else(invalid)?;
    let host = &rest[..colon_pos];
    let path = &rest[colon_pos + 1..];

    if user.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    let path = if path.is_empty() { "." } else { path };

    Ok((user.to_string(), host.to_string(), path.to_string()))
}
