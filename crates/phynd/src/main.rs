use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use phyn_client::PhynClient;
use phyn_client::RemoteClient;
use phynd::api;
use phynd::format_diagnostics;
use phynd::CommandDispatcher;
use phynd::Config;
use phynd::Coordinator;
use phynd::CoordinatorEvent;
use phynd::DeviceRegistry;
use phynd::EntityStateCache;
use phynd::PushListener;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Phyn water device daemon")]
struct Args {
    /// Config files to load, merged in order.
    #[arg(short, long = "config", default_value = "phynd.toml")]
    configs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::from_files(&args.configs) {
        Ok((config, warnings)) => {
            if !warnings.is_empty() {
                eprint!("{}", format_diagnostics(&warnings));
            }
            config
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    tracing::info!("phynd {} starting", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Loaded config: {:?}", config);

    let settings = config.polling.settings();
    let phyn = Arc::new(
        PhynClient::authenticate(
            config.phyn.credentials(),
            config
                .phyn
                .client_options(settings.timeout, config.retry.policy()),
        )
        .await
        .context("Failed to log in to Phyn")?,
    );
    let client: Arc<dyn RemoteClient> = phyn.clone();

    let registry = Arc::new(DeviceRegistry::new());
    let cache = Arc::new(EntityStateCache::new());
    let (coordinator, events) =
        Coordinator::new(client.clone(), cache.clone(), registry.clone(), settings);
    let coordinator = Arc::new(coordinator);

    coordinator
        .discover()
        .await
        .context("Failed to list Phyn devices")?;

    // The first tick of the poll loop polls right away.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn(coordinator.clone().run(shutdown_rx.clone()));
    tokio::spawn(handle_events(events, client.clone(), coordinator.clone()));

    let listener = if config.push.enabled {
        let listener = Arc::new(PushListener::new(
            phyn,
            cache.clone(),
            registry.clone(),
            config.push.settings(&config.polling),
        ));
        Some(tokio::spawn(listener.run(shutdown_rx)))
    } else {
        tracing::info!("Realtime updates disabled");
        None
    };

    let dispatcher = Arc::new(CommandDispatcher::new(
        client.clone(),
        cache.clone(),
        registry.clone(),
    ));

    let mut api_shutdown = None;
    if config.api.enabled {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(api::AppState {
            version: env!("CARGO_PKG_VERSION"),
            registry,
            cache,
            coordinator,
            dispatcher,
            units: config.phyn.units,
        });
        let (listen, port) = (config.api.listen.clone(), config.api.port);
        let server = tokio::spawn(async move {
            if let Err(e) = api::serve(listen, port, state, rx).await {
                tracing::error!("HTTP API server failed: {}", e);
            }
        });
        api_shutdown = Some((tx, server));
    } else {
        tracing::info!("HTTP API disabled");
    }

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    shutdown_tx.send(true).ok();
    if let Some((tx, server)) = api_shutdown {
        tx.send(()).ok();
        server.await.ok();
    }
    poller.await.ok();
    if let Some(listener) = listener {
        listener.await.ok();
    }

    tracing::info!("phynd shutdown complete");
    Ok(())
}

/// Log in again whenever the coordinator reports rejected credentials.
async fn handle_events(
    mut events: mpsc::Receiver<CoordinatorEvent>,
    client: Arc<dyn RemoteClient>,
    coordinator: Arc<Coordinator>,
) {
    while let Some(event) = events.recv().await {
        match event {
            CoordinatorEvent::ReauthRequired { reason } => {
                tracing::warn!("Session rejected ({}), logging in again", reason);
                match client.reauthenticate().await {
                    Ok(()) => {
                        coordinator.clear_reauth();
                        tracing::info!("Logged in again");
                    }
                    Err(e) => tracing::error!("Re-authentication failed: {}", e),
                }
            }
            CoordinatorEvent::DevicesChanged(change) => {
                tracing::info!(
                    "Devices changed: {} added, {} removed",
                    change.added.len(),
                    change.removed.len()
                );
            }
        }
    }
}
