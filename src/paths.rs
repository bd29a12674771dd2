use std::path::{Path, PathBuf};

/// On-disk layout rooted at the configured base directory:
///
/// ```text
/// <base>/labs/<category>/<lab>/vms/<vm>/   templates (read-only)
/// <base>/active/<exercise-id>/             running exercises
/// <base>/suspended/<exercise-id>/          managed-saved exercises
/// <base>/locks/<exercise-id>.lock          per-exercise advisory locks
/// <base>/logs/lab.log                      debug log
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn labs_dir(&self) -> PathBuf {
        self.base.join("labs")
    }

    pub fn active_dir(&self) -> PathBuf {
        self.base.join("active")
    }

    pub fn suspended_dir(&self) -> PathBuf {
        self.base.join("suspended")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.labs_dir().join(category)
    }

    pub fn lab_dir(&self, category: &str, lab: &str) -> PathBuf {
        self.category_dir(category).join(lab)
    }

    pub fn vms_dir(&self, category: &str, lab: &str) -> PathBuf {
        self.lab_dir(category, lab).join("vms")
    }

    pub fn vm_template_dir(&self, category: &str, lab: &str, vm: &str) -> PathBuf {
        self.vms_dir(category, lab).join(vm)
    }

    pub fn lock_path(&self, exercise_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{exercise_id}.lock"))
    }

    /// Running overlay for a VM. Always under `active/`: libvirt keeps this
    /// path in the domain definition, so the exercise must be in the active
    /// bucket whenever the domain runs.
    pub fn overlay_path(&self, exercise_id: &str, vm: &str) -> PathBuf {
        self.active_dir()
            .join(exercise_id)
            .join(vm)
            .join(format!("{exercise_id}-{vm}.qcow2"))
    }

    /// Every directory `lab init` creates.
    pub fn all_dirs(&self) -> [PathBuf; 5] {
        [
            self.labs_dir(),
            self.active_dir(),
            self.suspended_dir(),
            self.locks_dir(),
            self.logs_dir(),
        ]
    }
}

/// Path of a VM's base image inside its template directory.
pub fn base_image_path(vm_dir: &Path, vm: &str) -> PathBuf {
    vm_dir.join(format!("{vm}.qcow2"))
}
