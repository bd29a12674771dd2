pub mod ssh;

use crate::error::LabError;

/// Where and as whom to open a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the server closed the channel without reporting a status.
    pub exit_status: Option<u32>,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Opens authenticated sessions on a guest.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait RemoteShell {
    type Session: Session;

    async fn open(&self, target: &SshTarget) -> Result<Self::Session, LabError>;
}

/// One authenticated login. Commands run in the login's home directory.
#[allow(async_fn_in_trait)]
pub trait Session {
    /// Write `contents` to `remote_path`, replacing any existing file.
    async fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), LabError>;

    /// Run `command` and wait for it to exit.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, LabError>;

    async fn close(self) -> Result<(), LabError>;
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
pub mod fake {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Open { user: String, host: String },
        Upload { path: String, contents: String },
        Exec { command: String },
        Close { user: String },
    }

    /// Records every session event in order.
    #[derive(Default, Clone)]
    pub struct FakeShell {
        events: Arc<Mutex<Vec<Event>>>,
        exit_codes: BTreeMap<String, u32>,
        refuse_users: Vec<String>,
    }

    impl FakeShell {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make any command containing `needle` exit with `code`.
        pub fn exit_with(mut self, needle: &str, code: u32) -> Self {
            self.exit_codes.insert(needle.into(), code);
            self
        }

        pub fn refusing(mut self, user: &str) -> Self {
            self.refuse_users.push(user.into());
            self
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    pub struct FakeSession {
        user: String,
        events: Arc<Mutex<Vec<Event>>>,
        exit_codes: BTreeMap<String, u32>,
    }

    impl RemoteShell for FakeShell {
        type Session = FakeSession;

        async fn open(&self, target: &SshTarget) -> Result<FakeSession, LabError> {
            if self.refuse_users.contains(&target.username) {
                return Err(LabError::Ssh {
                    host: target.host.clone(),
                    port: target.port,
                    user: target.username.clone(),
                    message: "authentication rejected".into(),
                });
            }
            self.events.lock().unwrap().push(Event::Open {
                user: target.username.clone(),
                host: target.host.clone(),
            });
            Ok(FakeSession {
                user: target.username.clone(),
                events: self.events.clone(),
                exit_codes: self.exit_codes.clone(),
            })
        }
    }

    impl Session for FakeSession {
        async fn upload(&mut self, contents: &[u8], remote_path: &str) -> Result<(), LabError> {
            self.events.lock().unwrap().push(Event::Upload {
                path: remote_path.into(),
                contents: String::from_utf8_lossy(contents).into_owned(),
            });
            Ok(())
        }

        async fn exec(&mut self, command: &str) -> Result<ExecOutput, LabError> {
            self.events.lock().unwrap().push(Event::Exec {
                command: command.into(),
            });
            let code = self
                .exit_codes
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, code)| *code)
                .unwrap_or(0);
            Ok(ExecOutput {
                exit_status: Some(code),
                output: String::new(),
            })
        }

        async fn close(self) -> Result<(), LabError> {
            self.events.lock().unwrap().push(Event::Close { user: self.user });
            Ok(())
        }
    }
}
