use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::BackendDescriptorConfig;

/// One backend upstream: a loopback-bound SOCKS5 daemon running inside an
/// isolated network namespace whose egress is rotated out-of-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub port: u16,
    pub id: u32,
    pub namespace: String,
}

/// Immutable, in-memory catalogue of backend descriptors loaded once at
/// startup. Frozen after construction: there is no API to add or remove
/// backends at runtime.
#[derive(Debug)]
pub struct Registry {
    backends: HashMap<u16, BackendDescriptor>,
    // Preserves config order so the initial ready queue is deterministic.
    ports_in_order: Vec<u16>,
}

impl Registry {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open backend registry file {path:?}"))?;
        let reader = BufReader::new(file);
        let descriptors: Vec<BackendDescriptorConfig> = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse backend registry file {path:?} as JSON"))?;
        Self::from_descriptors(descriptors)
    }

    pub fn from_descriptors(descriptors: Vec<BackendDescriptorConfig>) -> Result<Self> {
        if descriptors.is_empty() {
            bail!("backend registry must not be empty");
        }

        let mut backends = HashMap::with_capacity(descriptors.len());
        let mut ports_in_order = Vec::with_capacity(descriptors.len());

        for d in descriptors {
            if d.port == 0 {
                bail!("backend entry has invalid port 0 (id={})", d.id);
            }
            if d.namespace.is_empty() {
                bail!("backend entry for port {} has an empty namespace", d.port);
            }
            if backends
                .insert(
                    d.port,
                    BackendDescriptor {
                        port: d.port,
                        id: d.id,
                        namespace: d.namespace,
                    },
                )
                .is_some()
            {
                bail!("duplicate backend port {} in registry config", d.port);
            }
            ports_in_order.push(d.port);
        }

        Ok(Self {
            backends,
            ports_in_order,
        })
    }

    pub fn get(&self, port: u16) -> Option<&BackendDescriptor> {
        self.backends.get(&port)
    }

    /// Ports in the order they appeared in the config file; used to seed the
    /// pool manager's initial ready queue.
    pub fn ports_in_order(&self) -> &[u16] {
        &self.ports_in_order
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16, id: u32, namespace: &str) -> BackendDescriptorConfig {
        BackendDescriptorConfig {
            port,
            id,
            namespace: namespace.to_owned(),
        }
    }

    #[test]
    fn test_load_valid_registry() -> Result<()> {
        let registry = Registry::from_descriptors(vec![
            descriptor(10800, 0, "ns0"),
            descriptor(10801, 1, "ns1"),
        ])?;
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ports_in_order(), &[10800, 10801]);
        assert_eq!(registry.get(10800).unwrap().namespace, "ns0");
        assert!(registry.get(10802).is_none());
        Ok(())
    }

    #[test]
    fn test_reject_empty_registry() {
        let err = Registry::from_descriptors(vec![]).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_reject_duplicate_ports() {
        let err =
            Registry::from_descriptors(vec![descriptor(10800, 0, "ns0"), descriptor(10800, 1, "ns1")])
                .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_reject_zero_port() {
        let err = Registry::from_descriptors(vec![descriptor(0, 0, "ns0")]).unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn test_reject_empty_namespace() {
        let err = Registry::from_descriptors(vec![descriptor(10800, 0, "")]).unwrap_err();
        assert!(err.to_string().contains("empty namespace"));
    }
}
