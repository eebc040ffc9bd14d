//! portpool
//!
//! Local proxy pool front-end.
//!
//! This binary:
//! - Loads the remote proxy registry from the credential file
//! - Binds the contiguous range of local dual-protocol proxy ports
//! - Warms up port bindings through the LRU scheduler
//! - Serves the control endpoint that hands out ready ports

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portpool::config::Config;
use portpool::pool::{self, PoolManager};
use portpool::proxy::ProxyListener;
use portpool::registry::Registry;
use portpool::web::{self, AppState};

/// How long in-flight tunnels get to drain after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portpool");

    let bootstrap = match startup(&config).await {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            error!(error = format!("{e:#}"), "startup failed");
            std::process::exit(1);
        }
    };

    match serve(bootstrap).await {
        Ok(()) => {
            info!("clean shutdown");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "unrecoverable runtime error");
            std::process::exit(2);
        }
    }
}

struct Bootstrap {
    pool: Arc<PoolManager>,
    listeners: Vec<ProxyListener>,
    web_listener: tokio::net::TcpListener,
    shutdown_tx: watch::Sender<bool>,
}

/// Everything that can refuse to start lives here; failures exit with 1.
async fn startup(config: &Config) -> Result<Bootstrap> {
    config.validate()?;

    let registry = Arc::new(Registry::load(&config.proxy_file)?);
    info!(
        remotes = registry.count(),
        max_active = config.max_active_proxies,
        "registry loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();

    let pool = Arc::new(PoolManager::new(
        Arc::clone(&registry),
        config.ports(),
        rebind_tx.clone(),
    ));

    let listeners = ProxyListener::bind_range(
        config.port_base,
        config.port_count,
        Arc::clone(&pool),
        shutdown_rx.clone(),
    )
    .await
    .context("failed to bind proxy port range")?;

    pool::spawn_workers(
        Arc::clone(&pool),
        rebind_rx,
        rebind_tx,
        config.port_count as usize,
        shutdown_rx,
    );
    pool.warmup(config.max_active_proxies);

    let web_addr = format!("{}:{}", config.host, config.web_port);
    let web_listener = tokio::net::TcpListener::bind(&web_addr)
        .await
        .with_context(|| format!("failed to bind control endpoint on {web_addr}"))?;
    info!(addr = %web_addr, "control endpoint bound");

    Ok(Bootstrap {
        pool,
        listeners,
        web_listener,
        shutdown_tx,
    })
}

async fn serve(bootstrap: Bootstrap) -> Result<()> {
    let Bootstrap {
        pool,
        listeners,
        web_listener,
        shutdown_tx,
    } = bootstrap;

    for listener in listeners {
        listener.spawn();
    }

    let app = web::router(AppState {
        pool: Arc::clone(&pool),
    });

    let shutdown = {
        let pool = Arc::clone(&pool);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            pool.begin_shutdown();
            let _ = shutdown_tx.send(true);
        }
    };

    axum::serve(web_listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("control endpoint failed")?;

    // Listeners and rebinders are stopping; give in-flight tunnels a moment
    // before the process exit force-closes their sockets.
    info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "draining tunnels");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}
