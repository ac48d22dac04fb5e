use anyhow::{Context, Result};
use duorec::app::App;
use duorec::ipc::server;
use duorec::notifier::{BroadcastNotifier, DesktopNotifier, FanoutNotifier, SharedNotifier};
use duorec::settings::load_settings;
use duorec::store::SessionStore;
use duorec::timer::TickSource;
use duorec::worker::WorkerClient;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings().context("failed to load settings")?;
    let store_path = match &settings.store_path {
        Some(path) => path.clone(),
        None => SessionStore::default_path().context("failed to locate data directory")?,
    };
    let store = SessionStore::open(&store_path)
        .with_context(|| format!("failed to open session store {}", store_path.display()))?;
    info!("session record at {}", store_path.display());

    let events = Arc::new(BroadcastNotifier::new(256));
    let mut sinks: Vec<SharedNotifier> = vec![events.clone()];
    if settings.desktop_notifications {
        sinks.push(Arc::new(DesktopNotifier));
    }
    let notifier: SharedNotifier = Arc::new(FanoutNotifier::new(sinks));

    let mut app = App::new(
        store,
        notifier.clone(),
        TickSource::Interval(settings.timer.tick_period()),
        settings.watcher.options(),
    );
    if let Some(options) = settings.worker.options() {
        match WorkerClient::spawn(options, notifier.clone()) {
            Ok(worker) => app = app.with_worker(worker),
            Err(e) => error!("worker unavailable: {}", e),
        }
    } else {
        info!("no worker program configured");
    }
    let app = Arc::new(app);

    if settings.auto_rename {
        let app = app.clone();
        let receiver = events.subscribe();
        tokio::spawn(async move { app.run_auto_rename(receiver).await });
    }

    if app.store.get().zoom_recording_dir.is_some() {
        app.start_watch(None);
    }

    let listener = server::bind(&settings.socket_path)?;
    tokio::select! {
        _ = server::serve(listener, app.clone(), events.clone()) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutting down");
        }
    }

    app.shutdown();
    if let Err(e) = std::fs::remove_file(&settings.socket_path) {
        warn!("failed to remove socket {}: {}", settings.socket_path.display(), e);
    }
    Ok(())
}
