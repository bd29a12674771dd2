//! What the operator is shown about an exercise or template.
//!
//! Visibility flags in `details.yaml` decide which fields are populated;
//! rendering never looks at the flags again, so a hidden field cannot leak
//! through any output format.

use facet::Facet;

use crate::error::LabError;
use crate::exercise::{ExerciseRecord, VmInstance};
use crate::provision::ProvisionReport;
use crate::template::{Credentials, LabTemplate, VmDetails};

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct CredentialView {
    pub username: String,
    pub password: String,
}

impl From<Credentials> for CredentialView {
    fn from(c: Credentials) -> Self {
        Self {
            username: c.username,
            password: c.password,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmReport {
    pub name: String,
    pub description: String,
    pub ip: Option<String>,
    pub user: Option<CredentialView>,
    pub root: Option<CredentialView>,
    /// Scripts that exited non-zero during the last provisioning run.
    pub failed_scripts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ExerciseReport {
    pub id: String,
    pub category: String,
    pub lab: String,
    pub state: String,
    pub created_at: String,
    pub vms: Vec<VmReport>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct TemplateVmReport {
    pub name: String,
    pub description: String,
    pub os_variant: String,
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct TemplateReport {
    pub category: String,
    pub lab: String,
    pub description: String,
    pub vms: Vec<TemplateVmReport>,
}

pub fn vm_report(instance: &VmInstance, details: &VmDetails) -> VmReport {
    VmReport {
        name: instance.name.clone(),
        description: details.description.clone(),
        ip: if details.show_ip { instance.ip.clone() } else { None },
        user: details
            .user_credentials()
            .filter(|_| details.show_creds)
            .map(CredentialView::from),
        root: details
            .root_credentials()
            .filter(|_| details.show_root_creds)
            .map(CredentialView::from),
        failed_scripts: Vec::new(),
    }
}

/// Build the report for `record`. `details_of` supplies each VM's
/// `details.yaml`; VMs without details show only their name.
pub fn exercise_report<'a>(
    record: &ExerciseRecord,
    details_of: impl Fn(&str) -> Option<&'a VmDetails>,
) -> ExerciseReport {
    let hidden = VmDetails::default();
    ExerciseReport {
        id: record.id.clone(),
        category: record.category.clone(),
        lab: record.lab.clone(),
        state: record.state.to_string(),
        created_at: record.created_at.clone(),
        vms: record
            .vms
            .iter()
            .map(|vm| vm_report(vm, details_of(&vm.name).unwrap_or(&hidden)))
            .collect(),
    }
}

impl ExerciseReport {
    /// Attach script failures from a provisioning run.
    pub fn with_provisioning(mut self, runs: &[(String, ProvisionReport)]) -> Self {
        for (vm, run) in runs {
            if let Some(report) = self.vms.iter_mut().find(|r| &r.name == vm) {
                report.failed_scripts = run.failed_scripts().map(|s| s.script.clone()).collect();
            }
        }
        self
    }

    pub fn to_json(&self) -> Result<String, LabError> {
        facet_json::to_string(self).map_err(|e| LabError::Render {
            message: e.to_string(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "[*] Exercise {} ({}/{}): {}\n",
            console::style(&self.id).bold(),
            self.category,
            self.lab,
            self.state
        );
        for vm in &self.vms {
            out.push_str(&format!("[*] {}", console::style(&vm.name).cyan()));
            if !vm.description.is_empty() {
                out.push_str(&format!(": {}", vm.description));
            }
            out.push('\n');
            if let Some(ip) = &vm.ip {
                out.push_str(&format!("      IP address: {ip}\n"));
            }
            if let Some(user) = &vm.user {
                out.push_str(&format!(
                    "      User credentials: {} / {}\n",
                    user.username, user.password
                ));
            }
            if let Some(root) = &vm.root {
                out.push_str(&format!(
                    "      Root credentials: {} / {}\n",
                    root.username, root.password
                ));
            }
            for script in &vm.failed_scripts {
                out.push_str(&format!(
                    "      {} script {script} exited unsuccessfully\n",
                    console::style("warning:").yellow()
                ));
            }
        }
        out
    }
}

pub fn template_report(template: &LabTemplate) -> TemplateReport {
    TemplateReport {
        category: template.category.clone(),
        lab: template.name.clone(),
        description: template.description.clone(),
        vms: template
            .vms
            .iter()
            .map(|vm| TemplateVmReport {
                name: vm.name.clone(),
                description: vm.details.description.clone(),
                os_variant: vm.details.os_variant.clone(),
            })
            .collect(),
    }
}

impl TemplateReport {
    pub fn to_json(&self) -> Result<String, LabError> {
        facet_json::to_string(self).map_err(|e| LabError::Render {
            message: e.to_string(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "[*] {}/{}: {}\n",
            self.category, self.lab, self.description
        );
        for vm in &self.vms {
            out.push_str(&format!("    {} ({})", vm.name, vm.os_variant));
            if !vm.description.is_empty() {
                out.push_str(&format!(": {}", vm.description));
            }
            out.push('\n');
        }
        out
    }
}

/// A plain list, one name per line.
pub fn render_list(names: &[String]) -> String {
    names.iter().map(|n| format!("{n}\n")).collect()
}

pub fn list_json(names: &[String]) -> Result<String, LabError> {
    facet_json::to_string(&names.to_vec()).map_err(|e| LabError::Render {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_state::ExerciseState;

    fn instance() -> VmInstance {
        VmInstance {
            name: "web".into(),
            domain: "ex-web".into(),
            overlay: "/opt/lab/active/ex/web/ex-web.qcow2".into(),
            ip: Some("192.168.122.44".into()),
            cpus: 2,
            memory_mb: 2048,
        }
    }

    fn details(show_ip: bool, show_creds: bool) -> VmDetails {
        VmDetails {
            description: "Vulnerable web server".into(),
            user_username: Some("student".into()),
            user_password: Some("hunter2".into()),
            root_username: Some("root".into()),
            root_password: Some("toor".into()),
            login_as_root: true,
            show_ip,
            show_creds,
            os_variant: "debian12".into(),
            ..VmDetails::default()
        }
    }

    fn record() -> ExerciseRecord {
        ExerciseRecord {
            id: "web-sqli-1".into(),
            category: "web".into(),
            lab: "sqli".into(),
            state: ExerciseState::Active,
            created_at: "2026-01-01T00:00:00Z".into(),
            vms: vec![instance()],
        }
    }

    #[test]
    fn hidden_ip_never_appears() {
        let d = details(false, true);
        let report = exercise_report(&record(), |_| Some(&d));
        assert_eq!(report.vms[0].ip, None);
        assert!(!report.render().contains("192.168.122.44"));
        assert!(!report.to_json().unwrap().contains("192.168.122.44"));
    }

    #[test]
    fn visible_fields_are_rendered() {
        let d = details(true, true);
        let report = exercise_report(&record(), |_| Some(&d));
        let text = report.render();
        assert!(text.contains("IP address: 192.168.122.44"));
        assert!(text.contains("User credentials: student / hunter2"));
        assert!(!text.contains("toor"));
    }

    #[test]
    fn missing_details_hide_everything() {
        let report = exercise_report(&record(), |_| None);
        assert_eq!(report.vms[0].ip, None);
        assert_eq!(report.vms[0].user, None);
        assert_eq!(report.vms[0].root, None);
    }

    #[test]
    fn root_credentials_need_their_own_flag() {
        let mut d = details(false, false);
        d.show_root_creds = true;
        let report = vm_report(&instance(), &d);
        assert_eq!(report.user, None);
        assert_eq!(report.root.unwrap().username, "root");
    }

    #[test]
    fn list_rendering() {
        let names = vec!["crypto".to_string(), "web".to_string()];
        assert_eq!(render_list(&names), "crypto\nweb\n");
        let json = list_json(&names).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains(r#""crypto""#));
    }
}
