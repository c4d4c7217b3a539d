use std::fmt::Debug;
use std::net::SocketAddr;

/// Structured record of a single SOCKS5 session, emitted once the connection
/// is fully torn down (or failed before relaying any bytes).
#[derive(Debug)]
#[allow(dead_code)]
pub enum AccessLog {
    Relayed {
        downstream: SocketAddr,
        backend_port: u16,
        target: String,
    },
    DialFailed {
        downstream: SocketAddr,
        backend_port: u16,
        target: String,
        reply_code: u8,
    },
    PoolEmpty {
        downstream: SocketAddr,
        target: String,
    },
    Rejected {
        downstream: SocketAddr,
        reason: &'static str,
    },
}
