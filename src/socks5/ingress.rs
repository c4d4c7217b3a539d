use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

use crate::access_log::AccessLog;
use crate::pool::{AcquireKind, Pool, PoolError};
use crate::refresh::RefreshWorker;
use crate::relay::relay;
use crate::service::RegistedService;
use crate::shutdown_ext::ShutdownGuardExt as _;
use crate::socks5::client::dial_via_backend;
use crate::socks5::{negotiate_no_auth, read_connect_request, write_reply, ReplyCode};

/// Accepts plain SOCKS5 CONNECT sessions and relays each one through a
/// backend on loan from the pool for the session's lifetime, per spec §4.4.
pub struct Socks5Ingress {
    listen_addr: String,
    listen_port: u16,
    pool: Arc<Pool>,
    refresh_worker: Arc<RefreshWorker>,
}

impl Socks5Ingress {
    pub fn new(
        listen_addr: String,
        listen_port: u16,
        pool: Arc<Pool>,
        refresh_worker: Arc<RefreshWorker>,
    ) -> Self {
        Self {
            listen_addr,
            listen_port,
            pool,
            refresh_worker,
        }
    }
}

#[async_trait]
impl RegistedService for Socks5Ingress {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()> {
        let listen_addr = format!("{}:{}", self.listen_addr, self.listen_port);
        tracing::debug!(%listen_addr, "binding SOCKS5 ingress listener");

        let listener = TcpListener::bind(&listen_addr).await.map_err(|source| {
            crate::error::GatewayError::IngressBind {
                addr: listen_addr.clone(),
                source,
            }
        })?;

        ready.send(()).await?;

        loop {
            let (downstream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept SOCKS5 connection");
                    continue;
                }
            };

            let pool = self.pool.clone();
            let refresh_worker = self.refresh_worker.clone();

            shutdown_guard.spawn_supervised_task_fn_with_span(
                tracing::info_span!("serve", client = ?peer_addr),
                move |shutdown_guard| async move {
                    handle_connection(downstream, peer_addr, pool, refresh_worker, shutdown_guard)
                        .await
                },
            );
        }
    }
}

async fn handle_connection(
    mut downstream: TcpStream,
    peer_addr: std::net::SocketAddr,
    pool: Arc<Pool>,
    refresh_worker: Arc<RefreshWorker>,
    shutdown_guard: ShutdownGuard,
) {
    if let Err(e) = negotiate_no_auth(&mut downstream).await {
        tracing::debug!(client = ?peer_addr, error = %e, "handshake rejected");
        tracing::info!(access_log = ?AccessLog::Rejected {
            downstream: peer_addr,
            reason: "handshake",
        });
        return;
    }

    let request = match read_connect_request(&mut downstream).await {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(client = ?peer_addr, error = %e, "request parsing rejected");
            tracing::info!(access_log = ?AccessLog::Rejected {
                downstream: peer_addr,
                reason: "request",
            });
            return;
        }
    };
    let target = format!("{}:{}", request.host, request.port);

    let backend_port = match pool
        .acquire(AcquireKind::SocksDirect {
            client_addr: peer_addr,
            target_host: request.host.clone(),
            target_port: request.port,
        })
        .await
    {
        Ok(port) => port,
        Err(PoolError::PoolEmpty) => {
            let _ = write_reply(&mut downstream, ReplyCode::GeneralFailure).await;
            tracing::info!(access_log = ?AccessLog::PoolEmpty {
                downstream: peer_addr,
                target,
            });
            return;
        }
        Err(PoolError::NotInUse(_)) => unreachable!("acquire never returns NotInUse"),
    };

    let upstream = match dial_via_backend(backend_port, &request.host, request.port).await {
        Ok(stream) => stream,
        Err(dial_error) => {
            let _ = write_reply(&mut downstream, dial_error.reply_code).await;
            tracing::info!(access_log = ?AccessLog::DialFailed {
                downstream: peer_addr,
                backend_port,
                target: target.clone(),
                reply_code: dial_error.reply_code as u8,
            });

            // No rotation side effect happened yet, skip straight to validation.
            if let Ok(ticket) = pool.release_without_refresh(backend_port).await {
                refresh_worker.spawn(&shutdown_guard, ticket);
            }
            return;
        }
    };

    if let Err(e) = write_reply(&mut downstream, ReplyCode::Success).await {
        tracing::debug!(client = ?peer_addr, error = %e, "failed to write success reply");
        if let Ok(ticket) = pool.release_for_refresh(backend_port).await {
            refresh_worker.spawn(&shutdown_guard, ticket);
        }
        return;
    }

    tracing::info!(access_log = ?AccessLog::Relayed {
        downstream: peer_addr,
        backend_port,
        target: target.clone(),
    });

    if let Err(e) = relay(downstream, upstream).await {
        tracing::debug!(client = ?peer_addr, backend_port, error = %e, "relay ended with an error");
    }

    // The backend was actually used: always run the full refresh cycle
    // before it returns to the pool, regardless of how the session ended.
    if let Ok(ticket) = pool.release_for_refresh(backend_port).await {
        refresh_worker.spawn(&shutdown_guard, ticket);
    }
}
