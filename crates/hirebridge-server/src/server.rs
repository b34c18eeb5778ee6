use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use hirebridge_cache::{InvalidationCoordinator, InvalidationRules, MemoryGuard, ResponseCache};
use hirebridge_core::{FeedMessage, OverflowSignal};
use hirebridge_realtime::{ChangeListener, ConnectionSupervisor, PgChangeSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::admin::{self, AdminState};
use crate::config::AppConfig;

pub fn build_app(state: AdminState) -> Router {
    admin::router(state).layer(TraceLayer::new_for_http())
}

/// Change feed pieces, present when `realtime.enabled`.
struct Realtime {
    source: Arc<PgChangeSource>,
    coordinator: Arc<InvalidationCoordinator>,
    supervisor: Arc<ConnectionSupervisor>,
    queue: mpsc::Receiver<FeedMessage>,
    install_triggers: bool,
}

pub struct HirebridgeServer {
    addr: SocketAddr,
    config: AppConfig,
    cache: Arc<ResponseCache>,
    memory_guard: Arc<MemoryGuard>,
    realtime: Option<Realtime>,
    state: AdminState,
    cancel: CancellationToken,
}

pub struct ServerBuilder {
    config: AppConfig,
    rules: Arc<InvalidationRules>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            rules: Arc::new(InvalidationRules::hirebridge()),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    /// Wires the cache and, when enabled, the change feed. Nothing is spawned
    /// and no connection is opened until [`HirebridgeServer::run`].
    pub fn build(self) -> anyhow::Result<HirebridgeServer> {
        let cfg = self.config;
        cfg.validate().map_err(anyhow::Error::msg)?;
        let addr = cfg.admin_addr().map_err(anyhow::Error::msg)?;

        let memory_guard = Arc::new(MemoryGuard::new(&cfg.memory)?);
        let cache = Arc::new(
            ResponseCache::new(&cfg.cache, self.rules.clone())?
                .with_memory_guard(memory_guard.clone()),
        );

        let mut state = AdminState::new(cache.clone());
        let realtime = if cfg.realtime.enabled {
            let rt = &cfg.realtime;
            let watched = self.rules.watched_tables();
            for table in &rt.tables {
                if !watched.contains(&table.as_str()) {
                    tracing::warn!(table = %table, "Subscribed table has no invalidation rules");
                }
            }

            let database_url = rt
                .database_url
                .as_deref()
                .context("realtime.database_url is required")?;
            let source = Arc::new(PgChangeSource::connect_lazy(
                database_url,
                rt.channel_prefix.clone(),
                rt.connect_timeout(),
            )?);

            let (tx, rx) = mpsc::channel(rt.queue_capacity);
            let overflow = OverflowSignal::new();
            let coordinator = Arc::new(
                InvalidationCoordinator::new(cache.clone(), self.rules.clone())
                    .with_overflow_signal(overflow.clone())
                    .with_clear_on_reconnect(rt.clear_on_reconnect),
            );
            let listener = Arc::new(ChangeListener::new(
                source.clone(),
                rt.tables.clone(),
                tx,
                overflow,
                rt.enqueue_timeout(),
            ));
            let supervisor = Arc::new(ConnectionSupervisor::new(
                listener,
                rt.backoff(),
                rt.connect_timeout(),
            ));

            state = state.with_realtime(coordinator.clone(), supervisor.clone());
            Some(Realtime {
                source,
                coordinator,
                supervisor,
                queue: rx,
                install_triggers: rt.install_triggers,
            })
        } else {
            tracing::warn!("Change feed disabled, cached entries only expire by TTL");
            None
        };

        Ok(HirebridgeServer {
            addr,
            config: cfg,
            cache,
            memory_guard,
            realtime,
            state,
            cancel: CancellationToken::new(),
        })
    }
}

impl HirebridgeServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn admin_state(&self) -> AdminState {
        self.state.clone()
    }

    /// Token that stops every background task and the admin server.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the background tasks and serves the admin routes until Ctrl-C
    /// or until the cancellation token fires.
    pub async fn run(self) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(
            self.cache
                .clone()
                .spawn_sweeper(self.config.cache.sweep_interval(), cancel.clone()),
        );
        tasks.push(
            self.memory_guard
                .clone()
                .spawn(self.cache.clone(), cancel.clone()),
        );

        if let Some(rt) = self.realtime {
            if rt.install_triggers {
                match rt.source.install_triggers(&self.config.realtime.tables).await {
                    Ok(()) => tracing::info!("Change notify triggers installed"),
                    Err(e) => tracing::warn!(error = %e, "Failed to install change notify triggers"),
                }
            }
            tasks.push(rt.coordinator.spawn(rt.queue, cancel.clone()));
            tasks.push(rt.supervisor.spawn(cancel.clone()));
        }

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("binding admin listener on {}", self.addr))?;
        tracing::info!("admin listening on {}", self.addr);

        let shutdown = cancel.clone();
        let served = axum::serve(listener, build_app(self.state))
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = shutdown.cancelled() => {}
                }
            })
            .await;

        cancel.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
