use std::sync::Arc;

use anyhow::Result;
use scopeguard::defer;
use tokio_graceful::ShutdownGuard;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::config::GatewayConfig;
use crate::control_interface::ControlInterface;
use crate::pool::Pool;
use crate::refresh::RefreshWorker;
use crate::registry::Registry;
use crate::service::RegistedService;
use crate::shutdown_ext::ShutdownGuardExt;
use crate::socks5::ingress::Socks5Ingress;
use crate::state::GatewayState;

/// Assembles the registry, pool, SOCKS5 ingress, and control API into a set
/// of supervised services and drives them to completion.
pub struct GatewayRuntime {
    services: Vec<(Box<dyn RegistedService + Send + Sync>, Span)>,
    state: Arc<GatewayState>,
}

impl GatewayRuntime {
    pub async fn from_config(config: GatewayConfig, registry_path: &std::path::Path) -> Result<Self> {
        let registry = Arc::new(
            Registry::load(registry_path).map_err(crate::error::GatewayError::RegistryLoad)?,
        );
        let config = Arc::new(config);
        let pool = Arc::new(Pool::new(&registry));
        let state = Arc::new(GatewayState::new());
        let refresh_worker = Arc::new(RefreshWorker::new(pool.clone(), registry.clone(), &config));

        let ingress_address = format!("{}:{}", config.socks_host, config.socks_port);

        let mut services: Vec<(Box<dyn RegistedService + Send + Sync>, Span)> = vec![
            (
                Box::new(Socks5Ingress::new(
                    config.socks_host.clone(),
                    config.socks_port,
                    pool.clone(),
                    refresh_worker.clone(),
                )),
                tracing::info_span!("socks5_ingress"),
            ),
            (
                Box::new(ControlInterface::new(
                    config.clone(),
                    pool,
                    refresh_worker,
                    state.clone(),
                    ingress_address,
                )),
                tracing::info_span!("control_interface"),
            ),
        ];
        services.shrink_to_fit();

        Ok(Self { services, state })
    }

    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    pub async fn serve_forever(self) -> Result<()> {
        self.serve_with_cancel(CancellationToken::new(), tokio::sync::oneshot::channel().0)
            .await
    }

    pub async fn serve_with_cancel(
        self,
        cancel_by_caller: CancellationToken,
        ready: tokio::sync::oneshot::Sender<()>,
    ) -> Result<()> {
        tracing::info!("starting gateway runtime");

        let cancel_before_func_return = CancellationToken::new();
        let for_cancel_safety = cancel_before_func_return.clone();
        defer! {
            for_cancel_safety.cancel();
        }

        let shutdown = {
            let cancel_before_func_return = cancel_before_func_return.clone();
            tokio_graceful::Shutdown::builder()
                .with_signal(async move {
                    tokio::select! {
                        _ = cancel_by_caller.cancelled() => {}
                        _ = cancel_before_func_return.cancelled() => {}
                        _ = tokio_graceful::default_signal() => {}
                    }
                })
                .with_overwrite_fn(tokio::signal::ctrl_c)
                .build()
        };

        {
            let mut receiver = self.state().ready.0.subscribe();
            shutdown.guard().spawn_supervised_task_current_span(async move {
                loop {
                    let _ = receiver.changed().await;
                    if *receiver.borrow_and_update() {
                        let _ = ready.send(());
                        break;
                    }
                }
            });
        }

        let maybe_err = self.serve(shutdown.guard()).await?;
        cancel_before_func_return.cancel();
        shutdown.shutdown().await;

        tracing::debug!("gateway runtime shutdown complete");
        if let Some(err) = maybe_err {
            return Err(err);
        }
        Ok(())
    }

    /// Drives every registered service until one fails or the shutdown guard
    /// is cancelled. A failing service (e.g. the SOCKS5 ingress failing to
    /// bind) is reported back to the caller so the process exits non-zero
    /// per spec §6/§7, rather than being swallowed after logging.
    async fn serve(mut self, shutdown_guard: ShutdownGuard) -> Result<Option<anyhow::Error>> {
        let service_count = self.services.len();
        tracing::info!("starting all {service_count} services");

        let (mut ready_receiver, mut error_receiver) = {
            let (ready_sender, ready_receiver) = tokio::sync::mpsc::channel(service_count);
            let (error_sender, error_receiver) = tokio::sync::mpsc::channel(service_count);

            for (service, span) in self.services.drain(..) {
                let ready_sender = ready_sender.clone();
                let error_sender = error_sender.clone();
                shutdown_guard.spawn_supervised_task_fn_with_span(
                    span,
                    |shutdown_guard| async move {
                        if let Err(e) = service.serve(shutdown_guard, ready_sender).await {
                            tracing::error!(error = ?e, "service failed");
                            let _ = error_sender.send(e).await;
                        }
                    },
                );
            }
            (ready_receiver, error_receiver)
        };

        let check_services_ready = async {
            for _ in 0..service_count {
                ready_receiver.recv().await;
            }
        };

        let maybe_err = tokio::select! {
            _ = check_services_ready => {
                tracing::info!("all services are ready");
                let _ = self.state.ready.0.send(true);

                tokio::select! {
                    maybe_err = error_receiver.recv() => maybe_err,
                    _ = shutdown_guard.cancelled() => None,
                }
            }
            maybe_err = error_receiver.recv() => maybe_err,
            _ = shutdown_guard.cancelled() => None,
        };

        if maybe_err.is_some() {
            tracing::error!("a service failed, canceling and exiting now");
        } else {
            tracing::info!("shutting down the gateway runtime gracefully");
        }

        Ok(maybe_err)
    }
}
