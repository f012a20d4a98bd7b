//! MO/LDAP sync CLI - run the synchronization engine or drive it by hand.
//!
//! `run` starts the directory pollers and reads remote change
//! notifications as JSON lines from stdin, one event per line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use moldap_common::Dn;
use moldap_directory::{
    CursorStore, DirectoryChange, DirectoryClient, FileCursorStore, LdapDirectory,
    MemoryCursorStore, PollerSet,
};
use moldap_remote::{GraphQlRemote, RemoteClient, TokenManager};
use moldap_sync::{
    EchoRegistry, EventDispatcher, RemoteEvent, RetryConfig, SyncEvent, SyncOrchestrator,
    SyncSettings, TemplateMapper,
};

#[derive(Parser)]
#[command(name = "moldap")]
#[command(about = "Synchronize MO and an LDAP directory")]
#[command(version)]
struct Cli {
    /// Settings file (JSON).
    #[arg(short, long, env = "MOLDAP_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the directory and process remote events from stdin.
    Run,

    /// Validate the settings file and the mapping templates.
    CheckConfig,

    /// Export one person to the directory.
    SyncPerson {
        /// Person UUID.
        uuid: Uuid,
    },

    /// Import one directory account into MO.
    SyncAccount {
        /// Distinguished name of the account.
        dn: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let settings = SyncSettings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::CheckConfig => check_config(settings),
        Commands::SyncPerson { uuid } => {
            let dispatcher = build_dispatcher(&settings)?;
            let event = SyncEvent::Remote(RemoteEvent::refresh_person(uuid));
            let outcome = dispatcher
                .process(&event)
                .await
                .with_context(|| format!("Failed to sync person {}", uuid))?;
            println!("{:?}", outcome);
            Ok(())
        }
        Commands::SyncAccount { dn } => {
            let dispatcher = build_dispatcher(&settings)?;
            let dn = Dn::parse(&dn).context("Invalid DN")?;
            let event = SyncEvent::Directory(DirectoryChange {
                unique_id: None,
                dn: dn.clone(),
            });
            let outcome = dispatcher
                .process(&event)
                .await
                .with_context(|| format!("Failed to sync account {}", dn))?;
            println!("{:?}", outcome);
            Ok(())
        }
    }
}

struct Clients {
    directory: DirectoryClient,
    remote: RemoteClient,
}

fn build_clients(settings: &SyncSettings) -> Result<Clients> {
    let ldap = LdapDirectory::new(settings.ldap.clone()).context("Failed to set up LDAP backend")?;
    let tokens = Arc::new(TokenManager::new(&settings.remote).context("Failed to set up auth")?);
    let graphql =
        GraphQlRemote::new(&settings.remote, tokens).context("Failed to set up MO client")?;
    Ok(Clients {
        directory: DirectoryClient::new(Arc::new(ldap), settings.ldap.clone()),
        remote: RemoteClient::new(Arc::new(graphql)),
    })
}

fn build_dispatcher(settings: &SyncSettings) -> Result<Arc<EventDispatcher>> {
    let clients = build_clients(settings)?;
    let mapper = TemplateMapper::new(&settings.mapping, clients.remote.clone())
        .context("Invalid mapping")?;

    let mut orchestrator = SyncOrchestrator::new(clients.directory, clients.remote, Arc::new(mapper))
        .with_echo_registry(Arc::new(EchoRegistry::new(settings.echo_ttl())))
        .with_retry(RetryConfig::from(&settings.retry));
    if let Some(it_system) = &settings.it_system {
        orchestrator = orchestrator.with_it_system(it_system.clone());
    }

    let dispatcher = EventDispatcher::new(Arc::new(orchestrator), settings.max_concurrent_events)
        .with_transport_retry(RetryConfig::from(&settings.retry))
        .with_purge_interval(settings.poll_interval() * 10);
    Ok(Arc::new(dispatcher))
}

fn check_config(settings: SyncSettings) -> Result<()> {
    let clients = build_clients(&settings)?;
    TemplateMapper::new(&settings.mapping, clients.remote).context("Invalid mapping")?;
    let bases = settings.ldap.poll_bases()?;

    println!("Settings OK");
    println!("  Kinds:       {}", settings.mapping.len());
    for (kind, rules) in &settings.mapping {
        println!(
            "    {:<20} {:<12} import={} export={}",
            kind.as_str(),
            rules.remote_kind.as_str(),
            rules.import_to_remote,
            rules.export_to_directory
        );
    }
    println!("  Poll bases:  {}", bases.len());
    for base in bases {
        println!("    {}", base);
    }
    println!("  Poll every:  {}s", settings.poll_interval_secs);
    println!("  Echo TTL:    {}s", settings.echo_ttl_secs);
    println!("  Concurrency: {}", settings.max_concurrent_events);
    Ok(())
}

async fn run(settings: SyncSettings) -> Result<()> {
    let dispatcher = build_dispatcher(&settings)?;
    let directory = dispatcher.orchestrator().directory().clone();

    let store: Arc<dyn CursorStore> = match &settings.cursor_file {
        Some(path) => Arc::new(FileCursorStore::new(path.clone())),
        None => Arc::new(MemoryCursorStore::new()),
    };

    let (directory_tx, directory_rx) = mpsc::channel(settings.max_concurrent_events * 10);
    let (remote_tx, remote_rx) = mpsc::channel(settings.max_concurrent_events * 10);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pollers = PollerSet::spawn(directory, store, directory_tx, settings.poll_interval())
        .context("Failed to start pollers")?;
    info!(pollers = pollers.len(), "Pollers started");

    let reader = tokio::spawn(read_remote_events(remote_tx));
    let running = tokio::spawn(dispatcher.run(remote_rx, directory_rx, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    pollers.shutdown().await;
    reader.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = running.await {
        error!(error = %e, "Dispatcher task ended abnormally");
    }
    Ok(())
}

/// Forward JSON-line events from stdin until it closes.
async fn read_remote_events(sender: mpsc::Sender<RemoteEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<RemoteEvent>(&line) {
                Ok(event) => {
                    if sender.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, line = %line, "Ignoring malformed event"),
            },
            Ok(None) => {
                info!("Remote event input closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read remote events");
                break;
            }
        }
    }
}
