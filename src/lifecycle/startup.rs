//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the shared balancer state from a validated configuration
//! - Bind the front-end and admin listeners
//! - Start background tasks (health checks, metrics exporter, config reload)
//! - Run the front-end until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners are bound in `build`, so callers know the addresses before traffic
//! - Background tasks subscribe to the same [`Shutdown`]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{self, AdminState};
use crate::balancer::Balancer;
use crate::config::watcher::ConfigWatcher;
use crate::config::{validate_config, BalancerConfig, ConfigError, FrontendMode};
use crate::health::ConfiguredProbe;
use crate::http::{HttpServer, HttpUpstream};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::shutdown_signal;
use crate::load_balancer::RegistryError;
use crate::net::{Listener, ListenerError, TcpProxy, TcpUpstream};
use crate::observability::metrics::init_exporter;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("initial backends: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),
}

enum Frontend {
    Http(TcpListener),
    Tcp(Listener),
}

/// A fully wired, bound, not yet running balancer process.
pub struct Application {
    config: BalancerConfig,
    config_path: Option<PathBuf>,
    balancer: Balancer,
    shutdown: Shutdown,
    frontend: Frontend,
    local_addr: SocketAddr,
    admin: Option<TcpListener>,
}

impl Application {
    pub async fn build(config: BalancerConfig, config_path: Option<PathBuf>) -> Result<Self, StartupError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let balancer = Balancer::from_config(&config)?;

        let (frontend, local_addr) = match config.listener.mode {
            FrontendMode::Http => {
                let listener = TcpListener::bind(&config.listener.bind_address).await?;
                let addr = listener.local_addr()?;
                (Frontend::Http(listener), addr)
            }
            FrontendMode::Tcp => {
                let listener = Listener::bind(&config.listener).await?;
                let addr = listener.local_addr()?;
                (Frontend::Tcp(listener), addr)
            }
        };

        let admin = if config.admin.enabled {
            Some(TcpListener::bind(&config.admin.bind_address).await?)
        } else {
            None
        };

        tracing::info!(
            address = %local_addr,
            mode = ?config.listener.mode,
            strategy = %config.strategy,
            backends = config.backends.len(),
            "Balancer initialized"
        );

        Ok(Self {
            config,
            config_path,
            balancer,
            shutdown: Shutdown::new(),
            frontend,
            local_addr,
            admin,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until [`Shutdown::trigger`] is called.
    pub async fn run(self) -> Result<(), StartupError> {
        let Self {
            config,
            config_path,
            balancer,
            shutdown,
            frontend,
            admin,
            ..
        } = self;

        if config.observability.metrics_enabled {
            if let Ok(addr) = config.observability.metrics_address.parse() {
                init_exporter(addr)?;
            }
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let monitor = balancer.monitor(ConfiguredProbe::from_config(&config.health_check), config.health_check.clone());
        tasks.push(tokio::spawn(monitor.run(shutdown.subscribe())));

        if let Some(listener) = admin {
            let state = AdminState::new(balancer.clone(), &config.admin.api_key);
            let rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = admin::serve(state, listener, rx).await {
                    tracing::error!(error = %e, "Admin API failed");
                }
            }));
        }

        if let Some(path) = config_path {
            tasks.push(spawn_reloader(path, balancer.clone(), shutdown.clone())?);
        }

        let result = match frontend {
            Frontend::Http(listener) => {
                let dispatcher = balancer.dispatcher(HttpUpstream::new(config.listener.max_body_bytes), &config.dispatch);
                HttpServer::new(dispatcher, &config.listener, &config.dispatch.sticky_header)
                    .run(listener, shutdown.subscribe())
                    .await
                    .map_err(StartupError::from)
            }
            Frontend::Tcp(listener) => {
                let dispatcher = balancer.dispatcher(TcpUpstream, &config.dispatch);
                TcpProxy::new(dispatcher)
                    .with_drain_timeout(config.dispatch.deadline())
                    .run(listener, shutdown.subscribe())
                    .await
                    .map_err(StartupError::from)
            }
        };

        // The front-end may have stopped on its own; make sure the rest follows.
        shutdown.trigger();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        result
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run_until_signal(self) -> Result<(), StartupError> {
        let shutdown = self.shutdown();
        tokio::spawn(async move {
            let signal = shutdown_signal().await;
            tracing::info!(signal, "Shutdown signal received");
            shutdown.trigger();
        });
        self.run().await
    }
}

/// Apply every valid configuration the watcher delivers.
fn spawn_reloader(path: PathBuf, balancer: Balancer, shutdown: Shutdown) -> Result<JoinHandle<()>, StartupError> {
    let (watcher, mut updates) = ConfigWatcher::new(&path);
    let handle = watcher.run()?;
    let mut rx = shutdown.subscribe();

    Ok(tokio::spawn(async move {
        let _watcher = handle;
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(config) = update else { break };
                    let summary = balancer.apply_config(&config);
                    tracing::info!(
                        added = summary.added.len(),
                        removed = summary.removed.len(),
                        reweighted = summary.reweighted.len(),
                        strategy = %config.strategy,
                        "Configuration reloaded"
                    );
                }
                _ = rx.recv() => break,
            }
        }
    }))
}
