use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Runtime configuration assembled from environment variables, per §6 of the
/// external-interface contract. Only the backend registry is loaded from a
/// file (see [`crate::registry::Registry::load`]); every other knob here is
/// an env var, matching the source's external contract.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_secret_token: String,
    pub api_secret_token_was_generated: bool,
    pub socks_host: String,
    pub socks_port: u16,
    pub api_port: u16,
    pub validation_target_host: String,
    pub validation_target_port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let (api_secret_token, api_secret_token_was_generated) =
            match std::env::var("API_SECRET_TOKEN") {
                Ok(v) if !v.is_empty() => (v, false),
                _ => {
                    let mut bytes = [0u8; 16];
                    rand::rng().fill_bytes(&mut bytes);
                    (hex::encode(bytes), true)
                }
            };

        Self {
            api_secret_token,
            api_secret_token_was_generated,
            socks_host: env_or("SOCKS_HOST", "0.0.0.0"),
            socks_port: env_or_parse("SOCKS_PORT", 10880),
            api_port: env_or_parse("API_PORT", 5000),
            validation_target_host: env_or("PROXY_VALIDATION_TARGET_HOST", "1.1.1.1"),
            validation_target_port: env_or_parse("PROXY_VALIDATION_TARGET_PORT", 443),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_or_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Raw backend descriptor as it appears in the registry config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendDescriptorConfig {
    pub port: u16,
    pub id: u32,
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_backend_descriptor() -> anyhow::Result<()> {
        let json = serde_json::json!([
            {"port": 10800, "id": 0, "namespace": "ns0"},
            {"port": 10801, "id": 1, "namespace": "ns1"}
        ]);
        let descriptors: Vec<BackendDescriptorConfig> = serde_json::from_value(json)?;
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].port, 10800);
        assert_eq!(descriptors[1].namespace, "ns1");
        Ok(())
    }
}
