//! Per-VM lifecycle: boot from an overlay, find the address, stop, save,
//! restore. Every hypervisor call goes through a [`Backend`].

use std::path::Path;
use std::time::Duration;

use crate::backend::{Backend, DomainSpec};
use crate::config::Config;
use crate::error::LabError;
use crate::exercise::VmInstance;

/// How long and how often to poll for a DHCP lease.
#[derive(Debug, Clone, Copy)]
pub struct Discovery {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Discovery {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.discovery_timeout(),
            interval: config.discovery_interval(),
        }
    }
}

pub struct VmController<'a, B> {
    backend: &'a B,
    discovery: Discovery,
}

impl<'a, B: Backend> VmController<'a, B> {
    pub fn new(backend: &'a B, discovery: Discovery) -> Self {
        Self { backend, discovery }
    }

    /// Create the overlay for `instance` and import it as a new domain.
    pub async fn boot(
        &self,
        instance: &VmInstance,
        base_image: &Path,
        os_variant: &str,
    ) -> Result<(), LabError> {
        let overlay = instance.overlay_path();
        self.backend.create_overlay(base_image, &overlay).await?;

        let spec = DomainSpec {
            name: instance.domain.clone(),
            vcpus: instance.cpus,
            memory_mb: instance.memory_mb,
            os_variant: os_variant.to_string(),
            disk: overlay,
        };
        self.backend.install_domain(&spec).await?;
        tracing::info!(domain = %instance.domain, "vm booted");
        Ok(())
    }

    /// Poll the lease table until the domain has an IPv4 address.
    pub async fn discover_address(&self, domain: &str) -> Result<String, LabError> {
        let deadline = tokio::time::Instant::now() + self.discovery.timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(ip) = self.backend.domain_address(domain).await? {
                tracing::info!(domain, ip = %ip, attempts, "address discovered");
                return Ok(ip);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(domain, attempts, "no DHCP lease before deadline");
                return Err(LabError::AddressTimeout {
                    domain: domain.to_string(),
                    seconds: self.discovery.timeout.as_secs(),
                });
            }
            tracing::debug!(domain, attempts, "no lease yet");
            tokio::time::sleep(self.discovery.interval).await;
        }
    }

    pub async fn stop(&self, domain: &str) -> Result<(), LabError> {
        self.backend.destroy_domain(domain).await
    }

    pub async fn suspend(&self, domain: &str) -> Result<(), LabError> {
        self.backend.managed_save(domain).await
    }

    pub async fn start(&self, domain: &str) -> Result<(), LabError> {
        self.backend.start_domain(domain).await
    }

    /// Start the domain from its saved state and return its fresh address.
    pub async fn resume(&self, domain: &str) -> Result<String, LabError> {
        self.start(domain).await?;
        self.discover_address(domain).await
    }
}
