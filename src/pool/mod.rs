use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::registry::Registry;

/// Why a backend is currently checked out of the ready queue.
#[derive(Debug, Clone)]
pub enum AcquireKind {
    ApiAcquired { client_ip: IpAddr },
    SocksDirect {
        client_addr: SocketAddr,
        target_host: String,
        target_port: u16,
    },
}

impl AcquireKind {
    fn kind_str(&self) -> &'static str {
        match self {
            AcquireKind::ApiAcquired { .. } => "api_acquired",
            AcquireKind::SocksDirect { .. } => "socks_direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InUseRecord {
    pub kind: AcquireKind,
    pub acquired_at: Instant,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool is empty")]
    PoolEmpty,
    #[error("backend port {0} is not in use")]
    NotInUse(u16),
}

/// Backend pool manager: the ready queue and the in-use map, protected by a
/// single mutex. No network I/O, subprocess call, or sleep is ever performed
/// while the mutex is held; every external side effect happens after the
/// guard is dropped.
pub struct Pool {
    registry_size: usize,
    inner: Mutex<PoolState>,
}

struct PoolState {
    ready: VecDeque<u16>,
    in_use: HashMap<u16, InUseRecord>,
}

/// A released backend, handed off to the caller so the refresh/validate
/// worker can be spawned outside the pool mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseTicket {
    pub port: u16,
    pub do_refresh: bool,
}

impl Pool {
    pub fn new(registry: &Registry) -> Self {
        let ready: VecDeque<u16> = registry.ports_in_order().iter().copied().collect();
        let registry_size = ready.len();
        Self {
            registry_size,
            inner: Mutex::new(PoolState {
                ready,
                in_use: HashMap::new(),
            }),
        }
    }

    /// Pops the head of the ready queue and marks it in-use. Non-blocking:
    /// fails immediately with `PoolError::PoolEmpty` rather than waiting for
    /// a backend to free up.
    pub async fn acquire(&self, kind: AcquireKind) -> Result<u16, PoolError> {
        let mut state = self.inner.lock().await;
        let port = state.ready.pop_front().ok_or(PoolError::PoolEmpty)?;
        state.in_use.insert(
            port,
            InUseRecord {
                kind,
                acquired_at: Instant::now(),
            },
        );
        Ok(port)
    }

    /// Releases a backend that was actually used to relay traffic: the
    /// refresh step must run before the backend is re-admitted.
    pub async fn release_for_refresh(&self, port: u16) -> Result<ReleaseTicket, PoolError> {
        let mut state = self.inner.lock().await;
        if state.in_use.remove(&port).is_none() {
            return Err(PoolError::NotInUse(port));
        }
        Ok(ReleaseTicket {
            port,
            do_refresh: true,
        })
    }

    /// Releases a backend on a fast-fail path where no upstream side effect
    /// occurred (DNS failure, dial refused, etc): skip the IP-rotation step
    /// and go straight to validation.
    pub async fn release_without_refresh(&self, port: u16) -> Result<ReleaseTicket, PoolError> {
        let mut state = self.inner.lock().await;
        if state.in_use.remove(&port).is_none() {
            return Err(PoolError::NotInUse(port));
        }
        Ok(ReleaseTicket {
            port,
            do_refresh: false,
        })
    }

    /// Called by the refresh/validate worker once it has finished with a
    /// port, regardless of whether validation succeeded. Backends are never
    /// dropped; they are always re-enqueued at the tail.
    pub async fn readmit(&self, port: u16) {
        let mut state = self.inner.lock().await;
        state.ready.push_back(port);
    }

    pub async fn snapshot(&self, ingress_address: &str) -> Snapshot {
        let state = self.inner.lock().await;
        Snapshot {
            ingress_address: ingress_address.to_owned(),
            pool_size: self.registry_size,
            ready_count: state.ready.len(),
            ready_ports: state.ready.iter().copied().collect(),
            in_use_count: state.in_use.len(),
            in_use: state
                .in_use
                .iter()
                .map(|(port, record)| {
                    (
                        *port,
                        InUseRecordView {
                            kind: record.kind.kind_str(),
                            acquired_seconds_ago: record.acquired_at.elapsed().as_secs_f64(),
                            client_ip: match &record.kind {
                                AcquireKind::ApiAcquired { client_ip } => {
                                    Some(client_ip.to_string())
                                }
                                AcquireKind::SocksDirect { client_addr, .. } => {
                                    Some(client_addr.ip().to_string())
                                }
                            },
                            target: match &record.kind {
                                AcquireKind::ApiAcquired { .. } => None,
                                AcquireKind::SocksDirect {
                                    target_host,
                                    target_port,
                                    ..
                                } => Some(format!("{target_host}:{target_port}")),
                            },
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InUseRecordView {
    pub kind: &'static str,
    pub acquired_seconds_ago: f64,
    pub client_ip: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub ingress_address: String,
    pub pool_size: usize,
    pub ready_count: usize,
    pub ready_ports: Vec<u16>,
    pub in_use_count: usize,
    pub in_use: HashMap<u16, InUseRecordView>,
}
