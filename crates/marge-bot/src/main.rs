use clap::Parser;
use log::{error, info};
use marge_bot::cli::Cli;
use marge_bot::coordinator::Coordinator;
use marge_bot::embargo::IntervalUnion;
use marge_bot::logger;
use marge_client::{ClientError, ForgeClient, GitLabClient};
use marge_config::{BotConfig, ConfigFile};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

/// Startup failures, sorted by exit code.
#[derive(Debug)]
enum Fatal {
    /// Exit 1: configuration is unusable.
    Config(anyhow::Error),
    /// Exit 2: the forge rejected our credentials.
    Auth(anyhow::Error),
    /// Exit 3: the forge speaks a dialect we don't understand.
    Incompatible(anyhow::Error),
}

impl Fatal {
    fn code(&self) -> u8 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::Auth(_) => 2,
            Fatal::Incompatible(_) => 3,
        }
    }

    fn message(&self) -> String {
        match self {
            Fatal::Config(e) => format!("configuration error: {e:#}"),
            Fatal::Auth(e) => format!("authentication error: {e:#}"),
            Fatal::Incompatible(e) => format!("forge incompatibility: {e:#}"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.debug.unwrap_or(false));

    match run(cli).await {
        Ok(()) => {
            info!("Clean shutdown");
            ExitCode::SUCCESS
        }
        Err(fatal) => {
            error!("{}", fatal.message());
            ExitCode::from(fatal.code())
        }
    }
}

/// Config file search: explicit path, then CWD, then the home directory.
fn find_config_file(cli: &Cli) -> Result<Option<ConfigFile>, Fatal> {
    if let Some(path) = &cli.config_file {
        return ConfigFile::load(path).map(Some).map_err(Fatal::Config);
    }
    let mut candidates = vec![PathBuf::from("marge-bot.toml")];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".marge-bot.toml"));
    }
    for candidate in candidates {
        if candidate.is_file() {
            info!("Loading config from {}", candidate.display());
            return ConfigFile::load(&candidate).map(Some).map_err(Fatal::Config);
        }
    }
    Ok(None)
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    let file = find_config_file(&cli)?;
    let config = BotConfig::resolve(file, cli.overrides()).map_err(Fatal::Config)?;

    let embargo = IntervalUnion::parse(&config.embargo).map_err(Fatal::Config)?;
    let token = config.read_token().map_err(Fatal::Config)?;
    if !config.ssh_key_file.is_file() {
        return Err(Fatal::Config(anyhow::anyhow!(
            "ssh key file {:?} does not exist",
            config.ssh_key_file
        )));
    }

    let client = GitLabClient::connect(&config.gitlab_url, &token)
        .await
        .map_err(|e| match e {
            ClientError::Protocol { .. } => Fatal::Incompatible(e.into()),
            other => Fatal::Auth(other.into()),
        })?;

    let bot = client
        .current_user()
        .await
        .map_err(|e| Fatal::Auth(e.into()))?;

    if config.impersonate_approvers && !bot.is_admin {
        return Err(Fatal::Config(anyhow::anyhow!(
            "{} is not an admin and cannot impersonate approvers",
            bot.username
        )));
    }
    if config.add_reviewers && !bot.is_admin {
        return Err(Fatal::Config(anyhow::anyhow!(
            "{} is not an admin and cannot look up Reviewed-by email addresses",
            bot.username
        )));
    }

    info!(
        "Running as {} against {}",
        bot.username, config.gitlab_url
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let coordinator = Coordinator::new(Arc::new(client), config, bot, embargo);
    coordinator.run(shutdown_rx).await.map_err(Fatal::Config)
}

/// SIGINT/SIGTERM flip the shutdown flag; workers finish any in-flight
/// finalise and stop picking candidates.
fn spawn_signal_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let terminated = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                    }
                    Err(e) => {
                        error!("Couldn't install SIGTERM handler: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminated => {}
        }
        info!("Shutdown signal received; finishing in-flight work");
        let _ = tx.send(true);
    });
}
