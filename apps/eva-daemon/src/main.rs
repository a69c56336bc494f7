use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eva_core::tasks::TaskHandle;
use eva_core::{load_config, write_schema_file, Config, EvaCore};
use eva_events::Bus;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    if let Ok(out) = std::env::var("EVA_SCHEMA_OUT") {
        if let Err(err) = write_schema_file(&out) {
            eprintln!("error: failed to write config schema to {out}: {err}");
            std::process::exit(2);
        }
        return;
    }

    eva_otel::init();

    let config = match resolve_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("configuration error: {err:#}");
            std::process::exit(2);
        }
    };

    let bus = Bus::default();
    let relay = spawn_event_relay(&bus);
    let core = match EvaCore::initialize(config, Some(bus)) {
        Ok(core) => Arc::new(core),
        Err(err) => {
            error!("failed to initialize core: {err}");
            std::process::exit(2);
        }
    };

    let cycle = {
        let core = core.clone();
        TaskHandle::new(
            "eva.cycle",
            tokio::spawn(async move {
                if let Err(err) = core.run().await {
                    error!(target: "eva::cycle", %err, "evolution cycle exited with error");
                }
            }),
        )
    };

    shutdown_signal().await;

    core.shutdown().await;
    if !cycle.shutdown_with_grace(Duration::from_secs(5)).await {
        warn!("evolution cycle did not stop within the grace period");
    }
    relay.shutdown_with_grace(Duration::from_millis(100)).await;
    info!("eva daemon stopped");
}

/// Config path from the first argument or `EVA_CONFIG`; defaults otherwise.
/// Environment overrides are applied last.
fn resolve_config() -> Result<Config> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("EVA_CONFIG").map(PathBuf::from));
    let mut cfg = match path {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            load_config(&path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    cfg.apply_env();
    Ok(cfg)
}

fn spawn_event_relay(bus: &Bus) -> TaskHandle {
    let mut rx = bus.subscribe();
    TaskHandle::new(
        "eva.events.relay",
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(env) => {
                        debug!(target: "eva::events", kind = %env.kind, payload = %env.payload, "event")
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "eva::events", skipped, "event relay lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }),
    )
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
