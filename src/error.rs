use miette::Diagnostic;
use thiserror::Error;

/// Coarse classification of a [`LabError`], used by callers that need to
/// branch on the failure rather than render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidConfig,
    ProvisionFailure,
    Io,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LabError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{what} '{name}' not found")]
    NotFound {
        what: &'static str,
        name: String,
        #[help]
        hint: Option<String>,
    },

    #[error("exercise '{id}' cannot {operation}: {reason}")]
    InvalidState {
        id: String,
        operation: &'static str,
        reason: String,
        #[help]
        hint: Option<String>,
    },

    #[error("invalid configuration in {path}: {message}")]
    InvalidConfig { path: String, message: String },

    #[error("libvirt error: {message}")]
    Libvirt {
        message: String,
        #[help]
        hint: String,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("address discovery for '{domain}' timed out after {seconds}s")]
    AddressTimeout { domain: String, seconds: u64 },

    #[error("ssh to {user}@{host}:{port} failed: {message}")]
    Ssh {
        host: String,
        port: u16,
        user: String,
        message: String,
    },

    #[error("failed to render output: {message}")]
    Render { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::NotFound { .. } => ErrorKind::NotFound,
            LabError::InvalidState { .. } => ErrorKind::InvalidState,
            LabError::ConfigLoad { .. }
            | LabError::ConfigParse { .. }
            | LabError::Validation { .. }
            | LabError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            LabError::Libvirt { .. }
            | LabError::ExternalCommand { .. }
            | LabError::AddressTimeout { .. }
            | LabError::Ssh { .. } => ErrorKind::ProvisionFailure,
            LabError::Render { .. } | LabError::Io { .. } => ErrorKind::Io,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LabError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        LabError::NotFound {
            what,
            name: name.into(),
            hint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_errors_share_a_kind() {
        let timeout = LabError::AddressTimeout {
            domain: "web-1".into(),
            seconds: 5,
        };
        let cmd = LabError::ExternalCommand {
            command: "qemu-img".into(),
            message: "boom".into(),
        };
        assert_eq!(timeout.kind(), ErrorKind::ProvisionFailure);
        assert_eq!(cmd.kind(), ErrorKind::ProvisionFailure);
    }

    #[test]
    fn not_found_message_names_the_object() {
        let err = LabError::not_found("lab", "web/sqli");
        assert_eq!(err.to_string(), "lab 'web/sqli' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
