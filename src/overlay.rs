use std::path::Path;

use tokio::process::Command;

use crate::error::LabError;

/// Create a qcow2 overlay backed by the given base image.
pub async fn create_overlay(base_image: &Path, overlay_path: &Path) -> Result<(), LabError> {
    ensure_parent(overlay_path).await?;

    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-f", "qcow2", "-b"])
        .arg(base_image)
        .args(["-F", "qcow2"])
        .arg(overlay_path);
    run("qemu-img", cmd).await?;

    tracing::info!(path = %overlay_path.display(), base = %base_image.display(), "created qcow2 overlay");
    Ok(())
}

/// Create an empty qcow2 disk of `size` (qemu-img size syntax, e.g. `40G`).
pub async fn create_blank_disk(path: &Path, size: &str) -> Result<(), LabError> {
    ensure_parent(path).await?;

    let mut cmd = Command::new("qemu-img");
    cmd.args(["create", "-f", "qcow2"]).arg(path).arg(size);
    run("qemu-img", cmd).await?;

    tracing::info!(path = %path.display(), size, "created blank qcow2 disk");
    Ok(())
}

/// Run an external tool to completion. A tool that cannot be spawned or
/// exits non-zero is an `ExternalCommand` failure, carrying stderr.
pub(crate) async fn run(name: &str, mut cmd: Command) -> Result<(), LabError> {
    tracing::debug!(command = ?cmd.as_std(), "running");
    let output = cmd.output().await.map_err(|e| spawn_failed(name, &e))?;

    if !output.status.success() {
        return Err(LabError::ExternalCommand {
            command: name.into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

pub(crate) fn spawn_failed(name: &str, err: &std::io::Error) -> LabError {
    let message = if err.kind() == std::io::ErrorKind::NotFound {
        format!("could not run {name}: not installed or not on PATH")
    } else {
        format!("could not run {name}: {err}")
    };
    LabError::ExternalCommand {
        command: name.into(),
        message,
    }
}

async fn ensure_parent(path: &Path) -> Result<(), LabError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| LabError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }
    Ok(())
}
