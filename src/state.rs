/// Process-wide readiness flag shared between the runtime and the control API's
/// `/readyz`-style health surface.
pub struct GatewayState {
    pub ready: (
        tokio::sync::watch::Sender<bool>,
        tokio::sync::watch::Receiver<bool>,
    ),
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayState {
    pub fn new() -> Self {
        GatewayState {
            ready: tokio::sync::watch::channel(false),
        }
    }
}
