#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use shadow_rs::shadow;

pub mod access_log;
pub mod config;
pub mod control_interface;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod shutdown_ext;
pub mod socks5;
pub mod state;

shadow!(build);
