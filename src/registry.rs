//! Read-only catalog of lab templates under `<base>/labs`.

use std::path::{Path, PathBuf};

use crate::error::LabError;
use crate::paths::{self, Layout};
use crate::template::{LabTemplate, VmDefinition, VmDetails, description_of};

pub const README: &str = "README.txt";
pub const DETAILS: &str = "details.yaml";

pub struct Registry {
    layout: Layout,
}

impl Registry {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn list_categories(&self) -> Result<Vec<String>, LabError> {
        list_dir_names(&self.layout.labs_dir())
    }

    pub fn list_labs(&self, category: &str) -> Result<Vec<String>, LabError> {
        let dir = self.layout.category_dir(category);
        if !dir.is_dir() {
            return Err(LabError::not_found("category", category));
        }
        list_dir_names(&dir)
    }

    pub fn load_template(&self, category: &str, name: &str) -> Result<LabTemplate, LabError> {
        let dir = self.layout.lab_dir(category, name);
        if !dir.is_dir() {
            return Err(LabError::NotFound {
                what: "lab",
                name: format!("{category}/{name}"),
                hint: Some(format!("run `lab list_labs {category}` to see available labs")),
            });
        }

        let instructions = read_optional(&dir.join(README))?;
        let vms_dir = self.layout.vms_dir(category, name);
        let vm_names = if vms_dir.is_dir() {
            list_dir_names(&vms_dir)?
        } else {
            Vec::new()
        };

        let vms = vm_names
            .iter()
            .map(|vm| self.load_vm_definition(category, name, vm))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LabTemplate {
            category: category.to_string(),
            name: name.to_string(),
            description: description_of(&instructions),
            instructions,
            dir,
            vms,
        })
    }

    pub fn load_vm_definition(
        &self,
        category: &str,
        lab: &str,
        vm: &str,
    ) -> Result<VmDefinition, LabError> {
        let dir = self.layout.vm_template_dir(category, lab, vm);
        if !dir.is_dir() {
            return Err(LabError::not_found("vm", format!("{category}/{lab}/{vm}")));
        }

        let details_path = dir.join(DETAILS);
        let contents = std::fs::read_to_string(&details_path).map_err(|e| LabError::InvalidConfig {
            path: details_path.display().to_string(),
            message: format!("cannot read VM details: {e}"),
        })?;
        let details = VmDetails::parse(&contents, &details_path)?;

        Ok(VmDefinition {
            name: vm.to_string(),
            base_image: paths::base_image_path(&dir, vm),
            details,
            instructions: read_optional(&dir.join(README))?,
            files: list_files(&dir.join("files"))?,
            user_scripts: list_files(&dir.join("user_scripts"))?,
            root_scripts: list_files(&dir.join("root_scripts"))?,
            dir,
        })
    }
}

/// Sorted names of the subdirectories of `dir`. A missing directory is empty.
fn list_dir_names(dir: &Path) -> Result<Vec<String>, LabError> {
    let mut names: Vec<String> = read_entries(dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
        .filter(|n| !n.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

/// Sorted regular files of `dir`; lexical order is the declared run order.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>, LabError> {
    let mut files: Vec<PathBuf> = read_entries(dir)?
        .into_iter()
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn read_entries(dir: &Path) -> Result<Vec<PathBuf>, LabError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LabError::io(format!("reading {}", dir.display()), e)),
    };
    Ok(entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
}

fn read_optional(path: &Path) -> Result<String, LabError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(LabError::io(format!("reading {}", path.display()), e)),
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Write a VM template with the given details and asset/script files.
    #[allow(clippy::too_many_arguments)]
    pub fn write_vm(
        layout: &Layout,
        category: &str,
        lab: &str,
        vm: &str,
        details: &str,
        files: &[&str],
        user_scripts: &[&str],
        root_scripts: &[&str],
    ) -> PathBuf {
        let dir = layout.vm_template_dir(category, lab, vm);
        for sub in ["files", "user_scripts", "root_scripts"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        std::fs::write(dir.join(DETAILS), details).unwrap();
        std::fs::write(dir.join(README), format!("{vm} instructions\n")).unwrap();
        std::fs::write(paths::base_image_path(&dir, vm), b"qcow2").unwrap();
        for (sub, names) in [("files", files), ("user_scripts", user_scripts), ("root_scripts", root_scripts)] {
            for name in names {
                std::fs::write(dir.join(sub).join(name), format!("#!/bin/sh\n# {name}\n")).unwrap();
            }
        }
        let lab_dir = layout.lab_dir(category, lab);
        std::fs::write(lab_dir.join(README), "Web exploitation basics\nStep 1: scan\n").unwrap();
        dir
    }

    const DETAILS_YAML: &str = "description: target\nos_variant: debian12\nuser_username: student\nuser_password: pw\nshow_ip: true\n";

    #[test]
    fn lists_categories_and_labs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_vm(&layout, "web", "xss", "box", DETAILS_YAML, &[], &[], &[]);
        write_vm(&layout, "web", "sqli", "box", DETAILS_YAML, &[], &[], &[]);
        write_vm(&layout, "crypto", "rsa", "box", DETAILS_YAML, &[], &[], &[]);

        let registry = Registry::new(layout);
        assert_eq!(registry.list_categories().unwrap(), vec!["crypto", "web"]);
        assert_eq!(registry.list_labs("web").unwrap(), vec!["sqli", "xss"]);
    }

    #[test]
    fn unknown_category_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(Layout::new(dir.path()));
        let err = registry.list_labs("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn load_template_reads_vms_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        write_vm(&layout, "web", "sqli", "web", DETAILS_YAML, &["b.txt", "a.txt"], &["02-two.sh", "01-one.sh"], &[]);
        write_vm(&layout, "web", "sqli", "db", DETAILS_YAML, &[], &[], &["setup.sh"]);

        let template = Registry::new(layout).load_template("web", "sqli").unwrap();
        assert_eq!(template.description, "Web exploitation basics");
        let names: Vec<_> = template.vms.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web"]);

        let web = &template.vms[1];
        let files: Vec<_> = web.files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(files, vec!["a.txt", "b.txt"]);
        let scripts: Vec<_> = web
            .user_scripts
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(scripts, vec!["01-one.sh", "02-two.sh"]);
        assert_eq!(web.instructions, "web instructions\n");
        assert!(web.base_image.ends_with("web/web.qcow2"));
    }

    #[test]
    fn missing_lab_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(Layout::new(dir.path()));
        let err = registry.load_template("web", "missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn missing_details_is_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let vm_dir = write_vm(&layout, "web", "sqli", "box", DETAILS_YAML, &[], &[], &[]);
        std::fs::remove_file(vm_dir.join(DETAILS)).unwrap();

        let err = Registry::new(layout)
            .load_vm_definition("web", "sqli", "box")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
