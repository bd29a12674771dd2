pub mod libvirt;

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::LabError;

/// What `virt-install` needs to import one exercise VM.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSpec {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub os_variant: String,
    pub disk: PathBuf,
}

/// The hypervisor operations the lab tool consumes.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Backend {
    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<(), LabError>;
    async fn install_domain(&self, spec: &DomainSpec) -> Result<(), LabError>;
    /// First IPv4 lease of the domain, if any yet.
    async fn domain_address(&self, domain: &str) -> Result<Option<String>, LabError>;
    /// Force power-off and undefine. A missing domain is not an error.
    async fn destroy_domain(&self, domain: &str) -> Result<(), LabError>;
    async fn managed_save(&self, domain: &str) -> Result<(), LabError>;
    /// Start the domain, restoring a managed-save image if present.
    async fn start_domain(&self, domain: &str) -> Result<(), LabError>;
}

pub fn create_backend(config: &Config) -> libvirt::LibvirtBackend {
    libvirt::LibvirtBackend::new(&config.libvirt_uri)
}

#[cfg(test)]
pub mod fake {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        CreateOverlay(String),
        Install(String),
        Address(String),
        Destroy(String),
        Save(String),
        Start(String),
    }

    /// In-memory hypervisor that records every call.
    #[derive(Default)]
    pub struct FakeBackend {
        calls: Mutex<Vec<Call>>,
        running: Mutex<BTreeSet<String>>,
        saved: Mutex<BTreeSet<String>>,
        pub addresses: BTreeMap<String, String>,
        pub default_address: Option<String>,
        pub fail_install: BTreeSet<String>,
        pub fail_save: BTreeSet<String>,
        fail_start: Mutex<BTreeSet<String>>,
    }

    /// `domain` is `<exercise>-<vm>`; match on the VM part.
    fn matches_vm(set: &BTreeSet<String>, domain: &str) -> bool {
        set.iter().any(|vm| domain == vm || domain.ends_with(&format!("-{vm}")))
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Report `ip` as the DHCP lease of `domain`.
        pub fn with_address(mut self, domain: &str, ip: &str) -> Self {
            self.addresses.insert(domain.into(), ip.into());
            self
        }

        /// Report `ip` for every domain without a specific address.
        pub fn answering(mut self, ip: &str) -> Self {
            self.default_address = Some(ip.into());
            self
        }

        pub fn failing_install(mut self, vm: &str) -> Self {
            self.fail_install.insert(vm.into());
            self
        }

        pub fn failing_save(mut self, vm: &str) -> Self {
            self.fail_save.insert(vm.into());
            self
        }

        pub fn failing_start(self, vm: &str) -> Self {
            self.fail_start.lock().unwrap().insert(vm.into());
            self
        }

        /// Let `vm` start again after `failing_start`.
        pub fn repair_start(&self, vm: &str) {
            self.fail_start.lock().unwrap().remove(vm);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        pub fn running(&self) -> Vec<String> {
            self.running.lock().unwrap().iter().cloned().collect()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Backend for FakeBackend {
        async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<(), LabError> {
            self.record(Call::CreateOverlay(overlay.display().to_string()));
            if !base.exists() {
                return Err(LabError::ExternalCommand {
                    command: "qemu-img".into(),
                    message: format!("{} missing", base.display()),
                });
            }
            if let Some(parent) = overlay.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(overlay, b"overlay").unwrap();
            Ok(())
        }

        async fn install_domain(&self, spec: &DomainSpec) -> Result<(), LabError> {
            self.record(Call::Install(spec.name.clone()));
            if matches_vm(&self.fail_install, &spec.name) {
                return Err(LabError::ExternalCommand {
                    command: "virt-install".into(),
                    message: format!("cannot import {}", spec.name),
                });
            }
            self.running.lock().unwrap().insert(spec.name.clone());
            Ok(())
        }

        async fn domain_address(&self, domain: &str) -> Result<Option<String>, LabError> {
            self.record(Call::Address(domain.into()));
            Ok(self
                .addresses
                .get(domain)
                .cloned()
                .or_else(|| self.default_address.clone()))
        }

        async fn destroy_domain(&self, domain: &str) -> Result<(), LabError> {
            self.record(Call::Destroy(domain.into()));
            self.running.lock().unwrap().remove(domain);
            self.saved.lock().unwrap().remove(domain);
            Ok(())
        }

        async fn managed_save(&self, domain: &str) -> Result<(), LabError> {
            self.record(Call::Save(domain.into()));
            if matches_vm(&self.fail_save, domain) {
                return Err(LabError::Libvirt {
                    message: format!("managed save of {domain} failed"),
                    hint: "disk full".into(),
                });
            }
            self.running.lock().unwrap().remove(domain);
            self.saved.lock().unwrap().insert(domain.into());
            Ok(())
        }

        async fn start_domain(&self, domain: &str) -> Result<(), LabError> {
            self.record(Call::Start(domain.into()));
            if matches_vm(&self.fail_start.lock().unwrap(), domain) {
                return Err(LabError::Libvirt {
                    message: format!("failed to start '{domain}'"),
                    hint: "saved state is unreadable".into(),
                });
            }
            self.saved.lock().unwrap().remove(domain);
            self.running.lock().unwrap().insert(domain.into());
            Ok(())
        }
    }
}
