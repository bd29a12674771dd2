//! Lab template data: the lab itself, its VM definitions, and the
//! per-VM `details.yaml` document.

use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::LabError;

/// Contents of a VM's `details.yaml`, as written by lab maintainers.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmDetails {
    #[facet(default)]
    pub description: String,
    pub user_username: Option<String>,
    pub user_password: Option<String>,
    pub root_username: Option<String>,
    pub root_password: Option<String>,
    #[facet(default)]
    pub login_as_root: bool,
    #[facet(default)]
    pub show_creds: bool,
    #[facet(default)]
    pub show_root_creds: bool,
    #[facet(default)]
    pub show_readme: bool,
    #[facet(default)]
    pub show_ip: bool,
    pub ssh_port: Option<u16>,
    #[facet(default)]
    pub os_variant: String,
    pub cpus: Option<u32>,
    /// Memory in MiB.
    pub mem: Option<u64>,
}

/// A username/password pair; only built when both halves are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn is_placeholder(value: &str) -> bool {
    value.starts_with('<') && value.ends_with('>')
}

impl VmDetails {
    pub fn parse(contents: &str, origin: &Path) -> Result<Self, LabError> {
        let details: VmDetails =
            facet_yaml::from_str(contents).map_err(|e| LabError::InvalidConfig {
                path: origin.display().to_string(),
                message: e.to_string(),
            })?;
        details.validate(origin)?;
        Ok(details)
    }

    fn validate(&self, origin: &Path) -> Result<(), LabError> {
        let invalid = |message: String| LabError::InvalidConfig {
            path: origin.display().to_string(),
            message,
        };

        if self.os_variant.trim().is_empty() {
            return Err(invalid("os_variant is required".into()));
        }
        if self.ssh_port == Some(0) {
            return Err(invalid("ssh_port must not be 0".into()));
        }
        if self.cpus == Some(0) {
            return Err(invalid("cpus must be at least 1".into()));
        }
        if let Some(mem) = self.mem
            && mem < 256
        {
            return Err(invalid(format!("mem must be at least 256 MiB (got {mem})")));
        }

        for (field, value) in [
            ("user_username", &self.user_username),
            ("user_password", &self.user_password),
            ("root_username", &self.root_username),
            ("root_password", &self.root_password),
        ] {
            if let Some(v) = non_empty(value)
                && is_placeholder(v)
            {
                return Err(invalid(format!("{field} still holds the placeholder '{v}'")));
            }
        }

        if non_empty(&self.user_username).is_some() && non_empty(&self.user_password).is_none() {
            return Err(invalid("user_username is set but user_password is missing".into()));
        }
        if self.login_as_root && self.root_credentials().is_none() {
            return Err(invalid(
                "login_as_root is set but root_username/root_password are missing".into(),
            ));
        }
        Ok(())
    }

    pub fn user_credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            username: non_empty(&self.user_username)?.to_string(),
            password: non_empty(&self.user_password)?.to_string(),
        })
    }

    pub fn root_credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            username: non_empty(&self.root_username)?.to_string(),
            password: non_empty(&self.root_password)?.to_string(),
        })
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port.unwrap_or(22)
    }
}

/// One VM of a lab template.
#[derive(Debug, Clone)]
pub struct VmDefinition {
    pub name: String,
    pub dir: PathBuf,
    pub base_image: PathBuf,
    pub details: VmDetails,
    /// VM-level `README.txt`, empty when absent.
    pub instructions: String,
    pub files: Vec<PathBuf>,
    pub user_scripts: Vec<PathBuf>,
    pub root_scripts: Vec<PathBuf>,
}

/// An immutable, reusable lab definition.
#[derive(Debug, Clone)]
pub struct LabTemplate {
    pub category: String,
    pub name: String,
    pub dir: PathBuf,
    /// First line of the lab `README.txt`.
    pub description: String,
    pub instructions: String,
    pub vms: Vec<VmDefinition>,
}

/// First line of an instructions document, without the trailing newline.
pub fn description_of(instructions: &str) -> String {
    instructions.lines().next().unwrap_or_default().trim().to_string()
}
