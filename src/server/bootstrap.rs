use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::server;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → load config → build state → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut gateway_config = config::GatewayConfig::load(&args.config_path)?;
    if !args.listen.is_empty() {
        gateway_config.listen = args.listen.clone();
    }
    if !args.admin_listen.is_empty() {
        gateway_config.admin_listen = args.admin_listen.clone();
    }

    let scheduler_tick_ms = gateway_config.scheduler_tick_ms;
    let state = server::GatewayState::new(gateway_config)?;

    let shutdown = Arc::new(Notify::new());

    start_scheduler(&state, scheduler_tick_ms, &shutdown);
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Some(otlp) = state.core.otlp.as_ref() {
        otlp.drain().await;
    }
    if let Some(webhooks) = state.core.webhooks.as_ref() {
        webhooks.flush_all().await;
    }

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Single periodic ticker driving every background housekeeping task:
/// due scheduled-key actions, webhook flush, OTLP export, and stale
/// circuit-breaker pruning. One ticker is sufficient as long as the
/// period stays at or under a second — see DESIGN.md.
fn start_scheduler(state: &server::GatewayState, tick_ms: u64, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let scheduler = crate::core::scheduler::Scheduler::new(Duration::from_millis(tick_ms.max(100)));

    // The scheduler's own shutdown handle is distinct from the server-wide
    // one; forward the latter into the former so one ctrl-c stops both.
    let scheduler_shutdown = scheduler.shutdown_handle();
    let forward_shutdown = shutdown.clone();
    tokio::spawn(async move {
        forward_shutdown.notified().await;
        scheduler_shutdown.notify_waiters();
    });

    tokio::spawn(async move {
        scheduler
            .run(move |now| {
                let state = state.clone();
                async move {
                    let executed = state.core.actions.execute_due(&state.core.gate.key_store, now).await;
                    if executed > 0 {
                        tracing::debug!(count = executed, "scheduler: executed due key actions");
                    }
                    const IDLE_HORIZON_MS: i64 = 3_600_000;
                    state.core.gate.sliding_window.gc(now, IDLE_HORIZON_MS);
                    if let Some(bucket) = state.core.gate.token_bucket.as_ref() {
                        bucket.gc(now, IDLE_HORIZON_MS);
                    }
                    if let Some(webhooks) = state.core.webhooks.as_ref() {
                        webhooks.flush_all().await;
                    }
                    if let Some(otlp) = state.core.otlp.as_ref() {
                        if let Some(tracer) = state.core.gate.tracer.as_ref() {
                            for trace in tracer.drain_new_completed() {
                                otlp.enqueue(trace);
                            }
                        }
                        if let Err(e) = otlp.flush_once().await {
                            tracing::warn!("otlp: flush failed, error={}", e);
                        }
                    }
                }
            })
            .await;
    });
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
