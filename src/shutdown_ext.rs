use tokio_graceful::ShutdownGuard;
use tracing::{Instrument, Span};

/// A supervised task is cancelled immediately when the shutdown guard is
/// cancelled, so every connection and background job unwinds quickly and
/// cleanly when the gateway is shutting down.
#[allow(dead_code)]
pub trait ShutdownGuardExt {
    #[inline]
    #[track_caller]
    fn spawn_supervised_task_fn_current_span<F, T>(&self, task: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> T + Send + 'static,
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = Span::current();
        self.spawn_supervised_task_fn_with_span(span, task)
    }

    #[inline]
    #[track_caller]
    fn spawn_supervised_task_current_span<T>(&self, task: T) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = Span::current();
        self.spawn_supervised_task_with_span(span, task)
    }

    #[track_caller]
    fn spawn_supervised_task_fn_with_span<F, T>(
        &self,
        span: Span,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> T + Send + 'static,
        T: std::future::Future<Output = ()> + Send + 'static;

    #[track_caller]
    fn spawn_supervised_task_with_span<T>(&self, span: Span, task: T) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static;
}

impl ShutdownGuardExt for ShutdownGuard {
    #[inline]
    #[track_caller]
    fn spawn_supervised_task_fn_with_span<F, T>(
        &self,
        span: Span,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> T + Send + 'static,
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.clone();
        self.spawn_supervised_task_with_span(span, async move { task(guard).await })
    }

    #[inline]
    #[track_caller]
    fn spawn_supervised_task_with_span<T>(&self, span: Span, task: T) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard_cloned = self.clone();
        let guard_for_drop = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = guard_cloned.cancelled() => {/* cancelled, drop the other future */}
                () = task.instrument(span) => {/* finished on its own */}
            };
            drop(guard_for_drop);
        })
    }
}
