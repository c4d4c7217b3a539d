mod restful;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use restful::RestfulControlInterface;
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

use crate::config::GatewayConfig;
use crate::pool::Pool;
use crate::refresh::RefreshWorker;
use crate::service::RegistedService;
use crate::state::GatewayState;

/// The HTTP control API: `/acquire`, `/release/{token}`, `/status`, plus the
/// `/livez`/`/readyz` health routes served on the same listener.
pub struct ControlInterface {
    config: Arc<GatewayConfig>,
    pool: Arc<Pool>,
    refresh_worker: Arc<RefreshWorker>,
    state: Arc<GatewayState>,
    ingress_address: String,
}

impl ControlInterface {
    pub fn new(
        config: Arc<GatewayConfig>,
        pool: Arc<Pool>,
        refresh_worker: Arc<RefreshWorker>,
        state: Arc<GatewayState>,
        ingress_address: String,
    ) -> Self {
        Self {
            config,
            pool,
            refresh_worker,
            state,
            ingress_address,
        }
    }
}

#[async_trait]
impl RegistedService for ControlInterface {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()> {
        tracing::info!("control API launching");

        // Built here, rather than in `new`, because `/release/{token}` needs
        // a `ShutdownGuard` to spawn the refresh/validate cycle the same way
        // the SOCKS5 ingress does, and the guard only exists once the
        // runtime has started supervising this service.
        let core = Arc::new(ControlInterfaceCore::new(
            self.pool.clone(),
            self.refresh_worker.clone(),
            self.state.clone(),
            self.ingress_address.clone(),
            shutdown_guard.clone(),
        ));
        let inner = RestfulControlInterface::new(self.config.clone(), core);

        tokio::select! {
            _ = shutdown_guard.cancelled() => { /* exit here */ }
            res = inner.serve(ready) => {
                if let Err(err) = &res {
                    tracing::error!("control API failed: {err:#}");
                }
                res?
            }
        }

        tracing::info!("control API exited");
        Ok(())
    }
}

pub struct ControlInterfaceCore {
    pool: Arc<Pool>,
    refresh_worker: Arc<RefreshWorker>,
    state: Arc<GatewayState>,
    ingress_address: String,
    shutdown_guard: ShutdownGuard,
}

impl ControlInterfaceCore {
    pub fn new(
        pool: Arc<Pool>,
        refresh_worker: Arc<RefreshWorker>,
        state: Arc<GatewayState>,
        ingress_address: String,
        shutdown_guard: ShutdownGuard,
    ) -> Self {
        Self {
            pool,
            refresh_worker,
            state,
            ingress_address,
            shutdown_guard,
        }
    }

    pub async fn livez(&self) -> bool {
        true
    }

    pub async fn readyz(&self) -> bool {
        *self.state.ready.1.borrow()
    }
}
