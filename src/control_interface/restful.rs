use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc::Sender;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::pool::AcquireKind;

use super::ControlInterfaceCore;

const HTTP_RESPONSE_SERVER_HEADER: &str =
    const_format::concatcp!("poolgate/", crate::build::PKG_VERSION);

pub struct RestfulControlInterface {
    config: Arc<GatewayConfig>,
    core: Arc<ControlInterfaceCore>,
}

#[derive(Serialize)]
struct AcquireResponse {
    backend_port_token_for_release: u16,
    socks5_proxy: String,
}

#[derive(Serialize)]
struct ReleaseResponse {
    released: u16,
    status: &'static str,
}

impl RestfulControlInterface {
    pub fn new(config: Arc<GatewayConfig>, core: Arc<ControlInterfaceCore>) -> Self {
        Self { config, core }
    }

    pub async fn serve(&self, ready: Sender<()>) -> Result<()> {
        let state = self.core.clone();
        let auth_token = self.config.api_secret_token.clone();

        let authed = Router::new()
            .route(
                "/acquire",
                get(
                    |State(core): State<Arc<ControlInterfaceCore>>,
                     ConnectInfo(addr): ConnectInfo<SocketAddr>| async move {
                        match core
                            .pool
                            .acquire(AcquireKind::ApiAcquired {
                                client_ip: addr.ip(),
                            })
                            .await
                        {
                            Ok(port) => Ok(Json(AcquireResponse {
                                backend_port_token_for_release: port,
                                socks5_proxy: format!("socks5://{}", core.ingress_address),
                            })),
                            Err(_) => Err(ApiError::PoolEmpty),
                        }
                    },
                ),
            )
            .route(
                "/release/{token}",
                post(
                    |State(core): State<Arc<ControlInterfaceCore>>,
                     Path(token): Path<u16>| async move {
                        let ticket = core
                            .pool
                            .release_for_refresh(token)
                            .await
                            .map_err(|_| ApiError::NotInUse(token))?;
                        core.refresh_worker.spawn(&core.shutdown_guard, ticket);
                        Ok::<_, ApiError>(Json(ReleaseResponse {
                            released: token,
                            status: "refreshing",
                        }))
                    },
                ),
            )
            .layer(axum::middleware::from_fn(move |req, next| {
                let auth_token = auth_token.clone();
                async move { require_bearer_token(auth_token, req, next).await }
            }))
            .with_state(state.clone());

        let app = Router::new()
            .merge(authed)
            .route(
                "/status",
                get(|State(core): State<Arc<ControlInterfaceCore>>| async move {
                    Json(core.pool.snapshot(&core.ingress_address).await)
                }),
            )
            .route(
                "/livez",
                get({
                    let core = self.core.clone();
                    move || async move {
                        if core.livez().await {
                            (StatusCode::OK, "ok")
                        } else {
                            (StatusCode::SERVICE_UNAVAILABLE, "not ok")
                        }
                    }
                }),
            )
            .route(
                "/readyz",
                get({
                    let core = self.core.clone();
                    move || async move {
                        if core.readyz().await {
                            (StatusCode::OK, "ok")
                        } else {
                            (StatusCode::SERVICE_UNAVAILABLE, "not ok")
                        }
                    }
                }),
            )
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(SetResponseHeaderLayer::overriding(
                        axum::http::header::SERVER,
                        HeaderValue::from_static(HTTP_RESPONSE_SERVER_HEADER),
                    )),
            );

        let addr = format!("0.0.0.0:{}", self.config.api_port);
        tracing::info!("control API listening on http://{addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|source| {
            crate::error::GatewayError::ControlApiBind {
                addr: addr.clone(),
                source,
            }
        })?;
        let _ = ready.send(()).await;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        tracing::info!("control API stopping");
        Ok(())
    }
}

async fn require_bearer_token(
    expected: String,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let provided = header.strip_prefix("Bearer ").unwrap_or("");
    if provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDescriptorConfig;
    use crate::pool::Pool;
    use crate::refresh::RefreshWorker;
    use crate::registry::Registry;
    use crate::state::GatewayState;
    use scopeguard::defer;
    use tokio::select;
    use tokio_graceful::Shutdown;

    fn test_config(api_port: u16) -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            api_secret_token: "test-token".to_owned(),
            api_secret_token_was_generated: false,
            socks_host: "127.0.0.1".to_owned(),
            socks_port: portpicker::pick_unused_port().unwrap(),
            api_port,
            validation_target_host: "1.1.1.1".to_owned(),
            validation_target_port: 443,
        })
    }

    /// The returned `Shutdown` must be kept alive for as long as the guard
    /// is in use; dropping it would cancel the guard immediately.
    fn test_core(
        pool: Arc<Pool>,
        registry: Arc<Registry>,
        config: &GatewayConfig,
        ingress_address: &str,
    ) -> (Arc<ControlInterfaceCore>, Shutdown) {
        let refresh_worker = Arc::new(RefreshWorker::new(pool.clone(), registry, config));
        let state = Arc::new(GatewayState::new());
        let shutdown = Shutdown::new(std::future::pending());
        let core = Arc::new(ControlInterfaceCore::new(
            pool,
            refresh_worker,
            state,
            ingress_address.to_owned(),
            shutdown.guard(),
        ));
        (core, shutdown)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_acquire_requires_bearer_token() -> Result<()> {
        let port = portpicker::pick_unused_port().unwrap();
        let config = test_config(port);

        let registry = Registry::from_descriptors(vec![BackendDescriptorConfig {
            port: 10800,
            id: 0,
            namespace: "ns0".to_owned(),
        }])?;
        let pool = Arc::new(Pool::new(&registry));
        let (core, _shutdown) = test_core(pool, Arc::new(registry), &config, "127.0.0.1:10880");

        let interface = RestfulControlInterface::new(config.clone(), core);
        let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel(1);
        let join_handle = tokio::spawn(async move { interface.serve(ready_tx).await });
        ready_rx.recv().await;

        let client = reqwest::ClientBuilder::new().no_proxy().build()?;

        let unauthorized = client
            .get(format!("http://127.0.0.1:{port}/acquire"))
            .send()
            .await?;
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let authorized = client
            .get(format!("http://127.0.0.1:{port}/acquire"))
            .bearer_auth(&config.api_secret_token)
            .send()
            .await?;
        assert_eq!(authorized.status(), StatusCode::OK);

        join_handle.abort();
        select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                defer! {
                    std::process::exit(1);
                }
                panic!("control API did not stop")
            }
            _ = join_handle => {}
        }

        Ok(())
    }

    /// S5: `/acquire` hands out a pool port as the release token, `/release/{token}`
    /// accepts it back, and `/status` reflects both the acquire and the release.
    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_acquire_release_status_cycle() -> Result<()> {
        let port = portpicker::pick_unused_port().unwrap();
        let config = test_config(port);

        let registry = Registry::from_descriptors(vec![BackendDescriptorConfig {
            port: 10800,
            id: 0,
            namespace: "ns0".to_owned(),
        }])?;
        let pool = Arc::new(Pool::new(&registry));
        let (core, _shutdown) = test_core(pool, Arc::new(registry), &config, "127.0.0.1:10880");

        let interface = RestfulControlInterface::new(config.clone(), core);
        let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel(1);
        let join_handle = tokio::spawn(async move { interface.serve(ready_tx).await });
        ready_rx.recv().await;

        let client = reqwest::ClientBuilder::new().no_proxy().build()?;

        let acquired: serde_json::Value = client
            .get(format!("http://127.0.0.1:{port}/acquire"))
            .bearer_auth(&config.api_secret_token)
            .send()
            .await?
            .json()
            .await?;
        let token = acquired["backend_port_token_for_release"]
            .as_u64()
            .expect("token field present") as u16;
        assert_eq!(token, 10800);

        let status_after_acquire: serde_json::Value = client
            .get(format!("http://127.0.0.1:{port}/status"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status_after_acquire["ready_count"], 0);
        assert_eq!(status_after_acquire["in_use_count"], 1);

        let bad_release = client
            .post(format!("http://127.0.0.1:{port}/release/9999"))
            .bearer_auth(&config.api_secret_token)
            .send()
            .await?;
        assert_eq!(bad_release.status(), StatusCode::BAD_REQUEST);

        let release = client
            .post(format!("http://127.0.0.1:{port}/release/{token}"))
            .bearer_auth(&config.api_secret_token)
            .send()
            .await?;
        assert_eq!(release.status(), StatusCode::OK);

        let status_after_release: serde_json::Value = client
            .get(format!("http://127.0.0.1:{port}/status"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(status_after_release["in_use_count"], 0);
        assert_eq!(status_after_release["ready_count"], 0);

        let unauthorized_acquire = client
            .get(format!("http://127.0.0.1:{port}/acquire"))
            .send()
            .await?;
        assert_eq!(unauthorized_acquire.status(), StatusCode::UNAUTHORIZED);

        join_handle.abort();
        select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                defer! {
                    std::process::exit(1);
                }
                panic!("control API did not stop")
            }
            _ = join_handle => {}
        }

        Ok(())
    }
}
