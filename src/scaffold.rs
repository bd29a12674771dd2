//! Authoring helpers: lay out the base directory, new labs, and new VMs.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::backend::DomainSpec;
use crate::backend::libvirt::LibvirtBackend;
use crate::error::LabError;
use crate::overlay;
use crate::paths::{self, Layout};
use crate::registry::{DETAILS, README};

const LAB_README: &str = "\
In this file, write instructions on what to do in this lab.
The first line is the description: a quick blurb describing the lab.
Created VMs go in the \"vms\" directory.
For each VM, put any files to transfer into its \"files\" directory; they are
copied to the VM's staging directory (/tmp by default) after it boots.
Scripts in \"user_scripts\" and \"root_scripts\" are copied the same way and run
as the matching user, in file name order.
Put credentials into each VM's \"details.yaml\".
";

const VM_README: &str = "\
In this file, write instructions specific to this VM.
They are shown to students ahead of the lab instructions when show_readme is set.
";

/// Parameters of `lab create_vm`.
#[derive(Debug, Clone)]
pub struct VmScaffold {
    pub category: String,
    pub lab: String,
    pub name: String,
    pub os_variant: String,
    pub size: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub existing_qcow2: Option<PathBuf>,
    pub iso: Option<PathBuf>,
}

enum ImageSource<'a> {
    Copy(&'a Path),
    Install(&'a Path),
}

fn validate_name(what: &str, name: &str) -> Result<(), LabError> {
    if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains(char::is_whitespace) {
        return Err(LabError::Validation {
            message: format!("invalid {what} name '{name}'"),
        });
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), LabError> {
    std::fs::create_dir_all(path).map_err(|e| LabError::io(format!("creating {}", path.display()), e))
}

fn write_file(path: &Path, contents: &str) -> Result<(), LabError> {
    std::fs::write(path, contents).map_err(|e| LabError::io(format!("writing {}", path.display()), e))
}

/// Create the base directory layout. Existing directories are left alone.
pub fn init(layout: &Layout) -> Result<Vec<PathBuf>, LabError> {
    let mut created = Vec::new();
    for dir in layout.all_dirs() {
        if !dir.is_dir() {
            create_dir(&dir)?;
            tracing::info!(path = %dir.display(), "created directory");
            created.push(dir);
        }
    }
    Ok(created)
}

/// Create an empty lab with a README skeleton.
pub fn create_lab(layout: &Layout, category: &str, name: &str) -> Result<PathBuf, LabError> {
    validate_name("category", category)?;
    validate_name("lab", name)?;

    let dir = layout.lab_dir(category, name);
    if dir.exists() {
        return Err(LabError::Validation {
            message: format!("lab '{category}/{name}' already exists"),
        });
    }
    create_dir(&layout.vms_dir(category, name))?;
    write_file(&dir.join(README), LAB_README)?;

    tracing::info!(category, lab = name, path = %dir.display(), "lab created");
    Ok(dir)
}

/// `details.yaml` skeleton. Placeholders must be replaced before the lab
/// can be started.
pub fn details_template(os_variant: &str, cpus: u32, memory_mb: u64) -> String {
    format!(
        "description: \"Write a description here\"
user_username: <user>
user_password: <password>
# Don't show credentials if the user isn't supposed to log in directly
show_creds: true
root_username: root
root_password: <password>
show_root_creds: false
login_as_root: false

show_readme: true
# Don't show the IP for scanning labs
show_ip: true
ssh_port: 22
os_variant: \"{os_variant}\"
cpus: {cpus}
mem: {memory_mb}
"
    )
}

/// Create a VM inside an existing lab and give it a base image, either by
/// copying an existing qcow2 or by installing from an ISO.
pub async fn create_vm(
    layout: &Layout,
    libvirt: &LibvirtBackend,
    req: &VmScaffold,
) -> Result<PathBuf, LabError> {
    validate_name("VM", &req.name)?;
    let lab_dir = layout.lab_dir(&req.category, &req.lab);
    if !lab_dir.is_dir() {
        return Err(LabError::NotFound {
            what: "lab",
            name: format!("{}/{}", req.category, req.lab),
            hint: Some(format!("create it first with `lab create_lab {} {}`", req.category, req.lab)),
        });
    }
    // An existing image wins over an ISO.
    let source = match (&req.existing_qcow2, &req.iso) {
        (Some(existing), _) if !existing.is_file() => {
            return Err(LabError::not_found("image", existing.display().to_string()));
        }
        (Some(existing), _) => ImageSource::Copy(existing),
        (None, Some(iso)) => ImageSource::Install(iso),
        (None, None) => {
            return Err(LabError::Validation {
                message: "a base image source is required: pass --existing-qcow2 or --iso".into(),
            });
        }
    };

    let dir = layout.vm_template_dir(&req.category, &req.lab, &req.name);
    if dir.exists() {
        return Err(LabError::Validation {
            message: format!("VM '{}' already exists in {}/{}", req.name, req.category, req.lab),
        });
    }
    for sub in ["files", "user_scripts", "root_scripts"] {
        create_dir(&dir.join(sub))?;
    }
    write_file(&dir.join(README), VM_README)?;
    write_file(
        &dir.join(DETAILS),
        &details_template(&req.os_variant, req.cpus, req.memory_mb),
    )?;

    let image = paths::base_image_path(&dir, &req.name);
    match source {
        ImageSource::Copy(existing) => {
            tokio::fs::copy(existing, &image).await.map_err(|e| {
                LabError::io(format!("copying {} to {}", existing.display(), image.display()), e)
            })?;
            tracing::info!(from = %existing.display(), to = %image.display(), "base image copied");
        }
        ImageSource::Install(iso) => {
            overlay::create_blank_disk(&image, &req.size).await?;
            let spec = DomainSpec {
                name: req.name.clone(),
                vcpus: req.cpus,
                memory_mb: req.memory_mb,
                os_variant: req.os_variant.clone(),
                disk: image.clone(),
            };
            libvirt.install_from_iso(&spec, iso).await?;
        }
    }

    // Every exercise overlay is backed by this image.
    std::fs::set_permissions(&image, std::fs::Permissions::from_mode(0o440))
        .map_err(|e| LabError::io(format!("setting permissions on {}", image.display()), e))?;

    tracing::info!(vm = %req.name, path = %dir.display(), "VM template created");
    Ok(dir)
}
