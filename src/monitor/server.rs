//! Monitor server

use crate::common::config::MonitorConfig;
use crate::common::error::Result;
use crate::common::utils::{Clock, SystemClock};
use crate::monitor::http::{create_router, MonitorState};
use crate::monitor::service::MonitorService;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct Monitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Serve until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        tracing::info!("Starting monitor");
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!(
            "  Partition timeout: {}ms, drain timeout: {}ms",
            self.config.network_partition_timeout_ms,
            self.config.drain_timeout_ms
        );

        let service = Arc::new(MonitorService::open(&self.config, self.clock.clone())?);
        let (stop_tx, stop_rx) = watch::channel(false);
        let sweep = start_health_sweep(service.clone(), &self.config, stop_rx);

        let router = create_router(MonitorState {
            service: service.clone(),
        });

        tracing::info!("✓ Monitor ready");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = stop_tx.send(true);
        let _ = sweep.await;
        service.registry().flush()?;

        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Monitor stopped");
        Ok(())
    }
}

/// Periodically re-run the decision engine over every group.
pub fn start_health_sweep(
    service: Arc<MonitorService>,
    config: &MonitorConfig,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let period = config.health_check_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let changed = service.health_sweep().await;
                    if changed > 0 {
                        tracing::debug!(groups = changed, "Health sweep updated groups");
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}
