//! Configuring a booted VM: push assets, run scripts, drop the README.
//!
//! [`plan`] turns a VM definition into an ordered list of sessions and
//! actions without touching the network; [`Provisioner::execute`] replays
//! that plan over a [`RemoteShell`].

use std::path::{Path, PathBuf};

use crate::error::LabError;
use crate::registry::README;
use crate::remote::{RemoteShell, Session, SshTarget, shell_escape};
use crate::template::{Credentials, VmDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    User,
    Root,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::User => "user",
            ScopeKind::Root => "root",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    File(PathBuf),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Upload { payload: Payload, remote_path: String },
    Run { script: String, command: String },
}

/// Everything done inside one login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub credentials: Credentials,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionPlan {
    pub scopes: Vec<Scope>,
}

impl ProvisionPlan {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.scopes.iter().all(|s| s.actions.is_empty())
    }
}

/// Exit status of one script, kept for the operator report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub scope: ScopeKind,
    pub script: String,
    pub exit_status: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub scripts: Vec<ScriptOutcome>,
}

impl ProvisionReport {
    pub fn failed_scripts(&self) -> impl Iterator<Item = &ScriptOutcome> {
        self.scripts.iter().filter(|s| s.exit_status != Some(0))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn staged(staging: &str, name: &str) -> String {
    format!("{}/{name}", staging.trim_end_matches('/'))
}

fn run_command(staging: &str, name: &str) -> String {
    let name = shell_escape(name);
    format!(
        "cd {} && chmod 755 {name} && ./{name}",
        shell_escape(staging)
    )
}

/// VM instructions followed by the lab instructions.
pub fn readme_text(vm_instructions: &str, lab_instructions: &str) -> String {
    let mut text = vm_instructions.to_string();
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(lab_instructions);
    text
}

fn asset_actions(def: &VmDefinition, staging: &str) -> Vec<Action> {
    def.files
        .iter()
        .map(|f| Action::Upload {
            payload: Payload::File(f.clone()),
            remote_path: staged(staging, &file_name(f)),
        })
        .collect()
}

fn script_actions(scripts: &[PathBuf], staging: &str) -> Vec<Action> {
    scripts
        .iter()
        .flat_map(|s| {
            let name = file_name(s);
            [
                Action::Upload {
                    payload: Payload::File(s.clone()),
                    remote_path: staged(staging, &name),
                },
                Action::Run {
                    command: run_command(staging, &name),
                    script: name,
                },
            ]
        })
        .collect()
}

fn readme_action(def: &VmDefinition, lab_instructions: &str) -> Option<Action> {
    def.details.show_readme.then(|| Action::Upload {
        payload: Payload::Text(readme_text(&def.instructions, lab_instructions)),
        remote_path: README.to_string(),
    })
}

/// Decide which sessions to open and what to do in each.
///
/// The root scope is needed when there are root scripts, or when there are
/// assets but no user to receive them. It requires `login_as_root` and root
/// credentials; anything less is an `InvalidConfig` error rather than a
/// silently skipped step.
pub fn plan(def: &VmDefinition, lab_instructions: &str, staging: &str) -> Result<ProvisionPlan, LabError> {
    let user = def.details.user_credentials();
    let mut scopes = Vec::new();

    if let Some(credentials) = &user {
        let mut actions = asset_actions(def, staging);
        actions.extend(script_actions(&def.user_scripts, staging));
        actions.extend(readme_action(def, lab_instructions));
        if !actions.is_empty() {
            scopes.push(Scope {
                kind: ScopeKind::User,
                credentials: credentials.clone(),
                actions,
            });
        }
    }

    let needs_root = !def.root_scripts.is_empty() || (!def.files.is_empty() && user.is_none());
    if needs_root {
        let credentials = match (def.details.login_as_root, def.details.root_credentials()) {
            (true, Some(c)) => c,
            _ => {
                return Err(LabError::InvalidConfig {
                    path: def.dir.join(crate::registry::DETAILS).display().to_string(),
                    message: format!(
                        "VM '{}' needs a root session (root scripts, or files without a user) \
                         but login_as_root with root credentials is not configured",
                        def.name
                    ),
                });
            }
        };

        let mut actions = Vec::new();
        if user.is_none() {
            actions.extend(asset_actions(def, staging));
            actions.extend(readme_action(def, lab_instructions));
        }
        actions.extend(script_actions(&def.root_scripts, staging));
        scopes.push(Scope {
            kind: ScopeKind::Root,
            credentials,
            actions,
        });
    }

    Ok(ProvisionPlan { scopes })
}

pub struct Provisioner<'a, S> {
    shell: &'a S,
}

impl<'a, S: RemoteShell> Provisioner<'a, S> {
    pub fn new(shell: &'a S) -> Self {
        Self { shell }
    }

    /// Replay `plan` against `host:port`, one session per scope.
    pub async fn execute(
        &self,
        vm: &str,
        plan: &ProvisionPlan,
        host: &str,
        port: u16,
    ) -> Result<ProvisionReport, LabError> {
        let mut report = ProvisionReport::default();
        for scope in &plan.scopes {
            let target = SshTarget {
                host: host.to_string(),
                port,
                username: scope.credentials.username.clone(),
                password: scope.credentials.password.clone(),
            };
            let mut session = self.shell.open(&target).await?;
            let result = run_scope(vm, scope, &mut session, &mut report).await;
            let closed = session.close().await;
            result?;
            if let Err(e) = closed {
                tracing::warn!(vm, scope = scope.kind.as_str(), "closing session: {e}");
            }
        }
        Ok(report)
    }
}

async fn run_scope<T: Session>(
    vm: &str,
    scope: &Scope,
    session: &mut T,
    report: &mut ProvisionReport,
) -> Result<(), LabError> {
    for action in &scope.actions {
        match action {
            Action::Upload { payload, remote_path } => {
                let bytes = match payload {
                    Payload::File(path) => tokio::fs::read(path).await.map_err(|e| {
                        LabError::io(format!("reading {}", path.display()), e)
                    })?,
                    Payload::Text(text) => text.clone().into_bytes(),
                };
                session.upload(&bytes, remote_path).await?;
                tracing::info!(vm, scope = scope.kind.as_str(), path = %remote_path, "uploaded");
            }
            Action::Run { script, command } => {
                let out = session.exec(command).await?;
                if out.success() {
                    tracing::info!(vm, scope = scope.kind.as_str(), script, "script finished");
                } else {
                    tracing::warn!(
                        vm,
                        scope = scope.kind.as_str(),
                        script,
                        exit_status = ?out.exit_status,
                        output = %out.output.trim(),
                        "script exited unsuccessfully"
                    );
                }
                report.scripts.push(ScriptOutcome {
                    scope: scope.kind,
                    script: script.clone(),
                    exit_status: out.exit_status,
                });
            }
        }
    }
    Ok(())
}
