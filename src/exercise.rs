//! Exercise identity and the persisted exercise record.

use std::path::PathBuf;

use facet::Facet;
use rand_core::{OsRng, RngCore};

use crate::config::Config;
use crate::logging::UtcTime;
use crate::template::LabTemplate;
use crate::vm_state::ExerciseState;

/// Build an exercise ID: `{category}-{lab}-{YYYYMMDDHHMMSS}-{suffix}`.
///
/// The 4-hex-digit suffix separates two starts of the same lab within one
/// second; callers still check the store before claiming the ID.
pub fn exercise_id(category: &str, lab: &str, now: &UtcTime, suffix: u16) -> String {
    format!("{category}-{lab}-{}-{suffix:04x}", now.compact())
}

pub fn random_suffix() -> u16 {
    (OsRng.next_u32() & 0xffff) as u16
}

/// Libvirt domain name for a VM of an exercise.
pub fn domain_name(exercise_id: &str, vm: &str) -> String {
    format!("{exercise_id}-{vm}")
}

/// One VM of a running or suspended exercise.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmInstance {
    pub name: String,
    pub domain: String,
    pub overlay: String,
    pub ip: Option<String>,
    pub cpus: u32,
    pub memory_mb: u64,
}

impl VmInstance {
    pub fn overlay_path(&self) -> PathBuf {
        PathBuf::from(&self.overlay)
    }
}

/// Contents of `exercise.json`.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct ExerciseRecord {
    pub id: String,
    pub category: String,
    pub lab: String,
    pub state: ExerciseState,
    pub created_at: String,
    pub vms: Vec<VmInstance>,
}

impl ExerciseRecord {
    /// A fresh record in `Starting` with one instance per VM definition.
    pub fn new(id: String, template: &LabTemplate, config: &Config, now: &UtcTime) -> Self {
        let layout = config.layout();
        let vms = template
            .vms
            .iter()
            .map(|def| VmInstance {
                name: def.name.clone(),
                domain: domain_name(&id, &def.name),
                overlay: layout.overlay_path(&id, &def.name).display().to_string(),
                ip: None,
                cpus: def.details.cpus.unwrap_or(config.defaults.cpus),
                memory_mb: def.details.mem.unwrap_or(config.defaults.memory_mb),
            })
            .collect();

        Self {
            id,
            category: template.category.clone(),
            lab: template.name.clone(),
            state: ExerciseState::Starting,
            created_at: now.rfc3339(),
            vms,
        }
    }

    #[cfg(test)]
    pub fn vm_names(&self) -> Vec<&str> {
        self.vms.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<String, String> {
        facet_json::to_string(self).map_err(|e| e.to_string())
    }

    pub fn from_json(contents: &str) -> Result<Self, String> {
        facet_json::from_str(contents).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{VmDefinition, VmDetails};

    fn template() -> LabTemplate {
        let vm = |name: &str, cpus: Option<u32>| VmDefinition {
            name: name.into(),
            dir: PathBuf::from("/t").join(name),
            base_image: PathBuf::from("/t").join(format!("{name}.qcow2")),
            details: VmDetails {
                os_variant: "debian12".into(),
                cpus,
                ..VmDetails::default()
            },
            instructions: String::new(),
            files: vec![],
            user_scripts: vec![],
            root_scripts: vec![],
        };
        LabTemplate {
            category: "web".into(),
            name: "sqli".into(),
            dir: PathBuf::from("/t"),
            description: "SQLi".into(),
            instructions: String::new(),
            vms: vec![vm("db", Some(2)), vm("web", None)],
        }
    }

    #[test]
    fn id_format() {
        let now = UtcTime::from_unix(1_709_210_096);
        assert_eq!(exercise_id("web", "sqli", &now, 0xab), "web-sqli-20240229123456-00ab");
    }

    #[test]
    fn same_second_ids_differ_by_suffix() {
        let now = UtcTime::from_unix(0);
        assert_ne!(exercise_id("a", "b", &now, 1), exercise_id("a", "b", &now, 2));
    }

    #[test]
    fn record_resolves_resources_and_domains() {
        let config = Config::default();
        let now = UtcTime::from_unix(0);
        let record = ExerciseRecord::new("web-sqli-x".into(), &template(), &config, &now);

        assert_eq!(record.state, ExerciseState::Starting);
        assert_eq!(record.vm_names(), vec!["db", "web"]);
        assert_eq!(record.vms[0].domain, "web-sqli-x-db");
        assert_eq!(record.vms[0].cpus, 2);
        assert_eq!(record.vms[1].cpus, config.defaults.cpus);
        assert_eq!(record.vms[1].memory_mb, config.defaults.memory_mb);
        assert_eq!(
            record.vms[1].overlay,
            "/opt/lab/active/web-sqli-x/web/web-sqli-x-web.qcow2"
        );
        assert!(record.vms.iter().all(|v| v.ip.is_none()));
    }

    #[test]
    fn record_json_round_trip_keeps_state() {
        let now = UtcTime::from_unix(0);
        let mut record = ExerciseRecord::new("web-sqli-x".into(), &template(), &Config::default(), &now);
        record.state = ExerciseState::Suspended;
        record.vms[0].ip = Some("192.168.122.10".into());

        let parsed = ExerciseRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
