use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;

use super::{Backend, DomainSpec};
use crate::error::LabError;
use crate::overlay;

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtBackend {
    uri: String,
}

impl LibvirtBackend {
    pub fn new(uri: &str) -> Self {
        Self { uri: uri.to_string() }
    }

    /// Run an interactive `virt-install` from an installer ISO onto `spec.disk`.
    /// Used when authoring a new VM template; the console is attached to
    /// this terminal until the installer finishes.
    pub async fn install_from_iso(
        &self,
        spec: &DomainSpec,
        iso: &Path,
    ) -> Result<(), LabError> {
        let status = Command::new("virt-install")
            .args(["--connect", &self.uri, "--name", &spec.name])
            .arg(format!("--vcpus={}", spec.vcpus))
            .arg(format!("--memory={}", spec.memory_mb))
            .arg(format!("--os-variant={}", spec.os_variant))
            .arg("--controller=scsi,model=virtio-scsi")
            .arg(format!("--disk=path={},bus=scsi", spec.disk.display()))
            .arg(format!("--cdrom={}", iso.display()))
            .arg("--noreboot")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| overlay::spawn_failed("virt-install", &e))?;

        if !status.success() {
            return Err(LabError::ExternalCommand {
                command: "virt-install".into(),
                message: format!("installer exited with {status}"),
            });
        }
        tracing::info!(domain = %spec.name, iso = %iso.display(), "installation finished");
        Ok(())
    }

    fn connect(&self) -> Result<ConnGuard, LabError> {
        // Keep libvirt from printing its own copy of every error to stderr.
        virt_error::clear_error_callback();

        Connect::open(Some(&self.uri))
            .map(ConnGuard)
            .map_err(|e| LabError::Libvirt {
                message: format!("failed to connect to libvirt: {e}"),
                hint: format!("ensure libvirtd is running and you have access to {}", self.uri),
            })
    }

    fn lookup(&self, conn: &Connect, domain: &str) -> Result<Domain, LabError> {
        Domain::lookup_by_name(conn, domain).map_err(|e| LabError::Libvirt {
            message: format!("domain '{domain}' lookup failed: {e}"),
            hint: format!("check `virsh -c {} list --all`", self.uri),
        })
    }
}

impl Backend for LibvirtBackend {
    async fn create_overlay(&self, base: &Path, overlay_path: &Path) -> Result<(), LabError> {
        overlay::create_overlay(base, overlay_path).await
    }

    async fn install_domain(&self, spec: &DomainSpec) -> Result<(), LabError> {
        let mut cmd = Command::new("virt-install");
        cmd.args(["--connect", &self.uri, "--name", &spec.name])
            .arg(format!("--vcpus={}", spec.vcpus))
            .arg(format!("--memory={}", spec.memory_mb))
            .arg(format!("--os-variant={}", spec.os_variant))
            .arg("--controller=scsi,model=virtio-scsi")
            .arg(format!("--disk=path={},bus=scsi", spec.disk.display()))
            .args(["--noautoconsole", "--import"]);
        overlay::run("virt-install", cmd).await?;

        tracing::info!(domain = %spec.name, vcpus = spec.vcpus, memory_mb = spec.memory_mb, "domain imported");
        Ok(())
    }

    async fn domain_address(&self, domain: &str) -> Result<Option<String>, LabError> {
        let conn = self.connect()?;
        let dom = self.lookup(&conn, domain)?;
        Ok(first_ipv4(&dom))
    }

    async fn destroy_domain(&self, domain: &str) -> Result<(), LabError> {
        let conn = self.connect()?;
        let Ok(dom) = Domain::lookup_by_name(&conn, domain) else {
            tracing::info!(domain, "domain already gone");
            return Ok(());
        };

        if is_running(&dom) {
            dom.destroy().map_err(|e| LabError::Libvirt {
                message: format!("force stop of '{domain}' failed: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
            tracing::info!(domain, "domain powered off");
        }
        dom.undefine_flags(virt::sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE)
            .map_err(|e| LabError::Libvirt {
                message: format!("failed to undefine '{domain}': {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        tracing::info!(domain, "domain undefined");
        Ok(())
    }

    async fn managed_save(&self, domain: &str) -> Result<(), LabError> {
        let conn = self.connect()?;
        let dom = self.lookup(&conn, domain)?;
        if !is_running(&dom) {
            tracing::warn!(domain, "domain not running, nothing to save");
            return Ok(());
        }
        dom.managed_save(0).map_err(|e| LabError::Libvirt {
            message: format!("managed save of '{domain}' failed: {e}"),
            hint: "check free space in the libvirt save directory".into(),
        })?;
        tracing::info!(domain, "domain state saved");
        Ok(())
    }

    async fn start_domain(&self, domain: &str) -> Result<(), LabError> {
        let conn = self.connect()?;
        let dom = self.lookup(&conn, domain)?;
        if is_running(&dom) {
            tracing::info!(domain, "domain already running");
            return Ok(());
        }
        dom.create().map_err(|e| LabError::Libvirt {
            message: format!("failed to start '{domain}': {e}"),
            hint: format!("check `virsh -c {} start {domain}` for details", self.uri),
        })?;
        tracing::info!(domain, "domain started");
        Ok(())
    }
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

fn first_ipv4(dom: &Domain) -> Option<String> {
    let ifaces = dom
        .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
        .ok()?;

    ifaces
        .iter()
        .flat_map(|iface| iface.addrs.iter())
        .find(|addr| addr.typed == 0)
        .map(|addr| addr.addr.clone())
}
