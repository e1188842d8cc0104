use std::path::PathBuf;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub const RELAY_INSTALL_HINT: &str = "Please install the Session Manager plugin: \
https://docs.aws.amazon.com/systems-manager/latest/userguide/session-manager-working-with-install-plugin.html";

#[derive(Debug, Error)]
pub enum EcsError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("no current context set; run `ecs config set-context` or `ecs config use-context` first")]
    NoActiveContext,

    #[error(
        "task {task} has more than one container ({}); choose one with --container",
        .candidates.join(", ")
    )]
    AmbiguousContainer {
        task: String,
        candidates: Vec<String>,
    },

    #[error("container {container} uses log driver '{driver}'; only awslogs is supported")]
    UnsupportedLogDriver { container: String, driver: String },

    #[error("relay executable '{program}' not found\n{}", RELAY_INSTALL_HINT)]
    RelayNotFound { program: String },

    #[error("relay process {program} failed")]
    Relay {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed")]
    RemoteApi {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("context registry {}", .path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl EcsError {
    pub fn remote(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::RemoteApi {
            operation,
            source: source.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn registry(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::Registry {
            path: path.into(),
            source: source.into(),
        }
    }
}
