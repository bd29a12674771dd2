use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys;
use russh::ChannelMsg;

use super::{ExecOutput, RemoteShell, Session, SshTarget, shell_escape};
use crate::config::SshConfig;
use crate::error::LabError;

const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Password-authenticated SSH over russh.
pub struct SshShell {
    known_hosts: Option<PathBuf>,
    accept_unknown_hosts: bool,
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(config: &SshConfig) -> Self {
        Self {
            known_hosts: config.known_hosts.as_ref().map(PathBuf::from),
            accept_unknown_hosts: config.accept_unknown_hosts,
            connect_timeout: Duration::from_secs(config.connect_timeout_s),
        }
    }

    fn policy(&self, target: &SshTarget) -> HostKeyPolicy {
        HostKeyPolicy {
            host: target.host.clone(),
            port: target.port,
            known_hosts: self.known_hosts.clone(),
            accept_unknown: self.accept_unknown_hosts,
        }
    }
}

/// Decides whether to trust the guest's host key.
///
/// A key listed in `known_hosts` is trusted; a key that contradicts its
/// entry is always refused; anything else is trusted only when unknown
/// hosts are explicitly accepted.
struct HostKeyPolicy {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
    accept_unknown: bool,
}

impl HostKeyPolicy {
    fn verdict(&self, key: &keys::PublicKey) -> bool {
        if let Some(path) = &self.known_hosts {
            match keys::check_known_hosts_path(&self.host, self.port, key, path) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(keys::Error::KeyChanged { line }) => {
                    tracing::warn!(
                        host = %self.host,
                        known_hosts = %path.display(),
                        line,
                        "host key changed, refusing connection"
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!(known_hosts = %path.display(), "cannot read known_hosts: {e}");
                }
            }
        }
        if !self.accept_unknown {
            tracing::warn!(host = %self.host, port = self.port, "unknown host key rejected");
        }
        self.accept_unknown
    }
}

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verdict(server_public_key))
    }
}

pub struct SshSession {
    handle: client::Handle<HostKeyPolicy>,
    target: SshTarget,
}

fn ssh_error(target: &SshTarget, message: impl Into<String>) -> LabError {
    LabError::Ssh {
        host: target.host.clone(),
        port: target.port,
        user: target.username.clone(),
        message: message.into(),
    }
}

impl RemoteShell for SshShell {
    type Session = SshSession;

    async fn open(&self, target: &SshTarget) -> Result<SshSession, LabError> {
        let config = Arc::new(client::Config::default());
        let addr = format!("{}:{}", target.host, target.port);
        let deadline = tokio::time::Instant::now() + self.connect_timeout;

        // sshd typically comes up a while after the DHCP lease appears.
        let mut handle = loop {
            tracing::debug!(addr, user = %target.username, "connecting SSH");
            match client::connect(config.clone(), &*addr, self.policy(target)).await {
                Ok(h) => break h,
                Err(russh::Error::UnknownKey) => {
                    return Err(ssh_error(
                        target,
                        "host key not trusted (set ssh.accept_unknown_hosts or add it to ssh.known_hosts)",
                    ));
                }
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!(addr, "SSH connect failed, retrying: {e}");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(ssh_error(target, format!("connect: {e}"))),
            }
        };

        let auth = handle
            .authenticate_password(&target.username, &target.password)
            .await
            .map_err(|e| ssh_error(target, format!("authentication: {e}")))?;
        if !auth.success() {
            return Err(ssh_error(target, "password authentication rejected"));
        }

        tracing::info!(addr, user = %target.username, "SSH session established");
        Ok(SshSession {
            handle,
            target: target.clone(),
        })
    }
}

impl SshSession {
    /// Run `command` on a fresh channel, optionally feeding `stdin`, and
    /// collect output until the channel closes.
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput, LabError> {
        let err = |e: russh::Error| ssh_error(&self.target, format!("`{command}`: {e}"));

        let mut channel = self.handle.channel_open_session().await.map_err(err)?;
        channel.exec(true, command).await.map_err(err)?;
        if let Some(bytes) = stdin {
            channel.data(bytes).await.map_err(err)?;
            channel.eof().await.map_err(err)?;
        }

        let mut exit_status = None;
        let mut output = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_status,
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }
}

impl Session for SshSession {
    async fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), LabError> {
        let command = format!("cat > {}", shell_escape(remote_path));
        let result = self.run(&command, Some(contents)).await?;
        if !result.success() {
            return Err(ssh_error(
                &self.target,
                format!("upload to {remote_path} failed: {}", result.output.trim()),
            ));
        }
        tracing::debug!(path = remote_path, bytes = contents.len(), "uploaded");
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, LabError> {
        tracing::debug!(user = %self.target.username, command, "exec");
        self.run(command, None).await
    }

    async fn close(self) -> Result<(), LabError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ssh_error(&self.target, format!("disconnect: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;

    #[test]
    fn shell_takes_policy_from_config() {
        let config = SshConfig {
            known_hosts: Some("/etc/lab/known_hosts".into()),
            accept_unknown_hosts: true,
            connect_timeout_s: 30,
        };
        let shell = SshShell::new(&config);
        assert_eq!(shell.known_hosts, Some(PathBuf::from("/etc/lab/known_hosts")));
        assert!(shell.accept_unknown_hosts);
        assert_eq!(shell.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn policy_is_per_target() {
        let shell = SshShell::new(&SshConfig::default());
        let target = SshTarget {
            host: "192.168.122.9".into(),
            port: 2222,
            username: "student".into(),
            password: "pw".into(),
        };
        let policy = shell.policy(&target);
        assert_eq!(policy.host, "192.168.122.9");
        assert_eq!(policy.port, 2222);
        assert!(!policy.accept_unknown);
    }
}
