use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tokio_graceful::ShutdownGuard;

use crate::config::GatewayConfig;
use crate::pool::{Pool, ReleaseTicket};
use crate::registry::Registry;
use crate::shutdown_ext::ShutdownGuardExt as _;
use crate::socks5::client::dial_via_backend;
use crate::socks5::VALIDATION_TIMEOUT;

const REFRESH_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(60);
const IP_REFRESH_WAIT: Duration = Duration::from_secs(5);

/// Runs the external IP-rotation command, then a SOCKS5 validation probe,
/// per spec §4.3. Spawned once per release, never while the pool mutex is
/// held.
pub struct RefreshWorker {
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    validation_host: String,
    validation_port: u16,
}

impl RefreshWorker {
    pub fn new(pool: Arc<Pool>, registry: Arc<Registry>, config: &GatewayConfig) -> Self {
        Self {
            pool,
            registry,
            validation_host: config.validation_target_host.clone(),
            validation_port: config.validation_target_port,
        }
    }

    /// Spawns the refresh/validate cycle for `ticket.port` as a supervised
    /// background task and returns immediately.
    pub fn spawn(self: &Arc<Self>, shutdown_guard: &ShutdownGuard, ticket: ReleaseTicket) {
        let worker = self.clone();
        shutdown_guard.spawn_supervised_task_fn_current_span(move |_guard| async move {
            worker.run(ticket).await;
        });
    }

    async fn run(&self, ticket: ReleaseTicket) {
        let port = ticket.port;

        if ticket.do_refresh {
            let refreshed = self.refresh(port).await;
            if refreshed {
                tokio::time::sleep(IP_REFRESH_WAIT).await;
            }
        }

        let validated = self.validate(port).await;
        if validated {
            tracing::info!(port, "backend validated, returning to pool");
        } else {
            tracing::warn!(
                port,
                "backend failed validation, re-enqueueing anyway (self-healing pool)"
            );
        }

        // Backends are never dropped regardless of the outcome.
        self.pool.readmit(port).await;
    }

    /// Invokes the external IP-rotation command for `port`. Returns whether
    /// it completed successfully within the 60s hard cap; on timeout or
    /// failure, validation still proceeds per spec.
    async fn refresh(&self, port: u16) -> bool {
        let Some(backend) = self.registry.get(port) else {
            tracing::error!(port, "refresh requested for unknown backend port");
            return false;
        };

        let script = manage_pool_script_path();
        let mut command = Command::new("sudo");
        command
            .arg(&script)
            .arg("refresh-ip")
            .arg(&backend.namespace)
            .arg(backend.id.to_string());

        tracing::info!(port, namespace = %backend.namespace, id = backend.id, "refreshing backend IP");

        let spawned = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to spawn IP-refresh command");
                return false;
            }
        };

        match timeout(REFRESH_SUBPROCESS_TIMEOUT, spawned.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                tracing::warn!(port, status = ?output.status, "IP-refresh command exited with failure");
                false
            }
            Ok(Err(e)) => {
                tracing::error!(port, error = %e, "IP-refresh command failed to run");
                false
            }
            Err(_) => {
                tracing::error!(port, "IP-refresh command timed out after 60s");
                false
            }
        }
    }

    /// Opens a SOCKS5 CONNECT through the backend to the validation target.
    async fn validate(&self, port: u16) -> bool {
        match timeout(
            VALIDATION_TIMEOUT,
            dial_via_backend(port, &self.validation_host, self.validation_port),
        )
        .await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(port, error = %e, "validation probe rejected by backend");
                false
            }
            Err(_) => {
                tracing::debug!(port, "validation probe timed out");
                false
            }
        }
    }
}

/// The external rotation script is expected to live alongside the running
/// binary, mirroring the source's `script_dir/../manage_pool.sh` resolution.
fn manage_pool_script_path() -> std::path::PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.join("manage_pool.sh")))
        .unwrap_or_else(|| std::path::PathBuf::from("manage_pool.sh"))
}
