use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

/// A registered service is a core component of the gateway runtime. Once the
/// runtime is built, each service is started and kept running in a background
/// supervised task. Any service that fails causes the whole runtime to shut
/// down.
///
/// The async task driving `serve` is cancelled automatically once the runtime
/// is cancelled, so implementations don't need to poll `shutdown_guard.cancelled()`
/// themselves unless they want to react to shutdown before their own work
/// finishes.
#[async_trait]
pub trait RegistedService {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()>;
}
