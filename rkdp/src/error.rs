use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to dial {path:?}: {source}")]
    Dial {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("timed out after {timeout:?} dialing {path:?}")]
    DialTimeout { path: PathBuf, timeout: Duration },

    #[error("kubelet rejected registration: {0}")]
    Register(Box<tonic::Status>),

    #[error("failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to remove socket {path:?}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),
}

impl From<tonic::Status> for PluginError {
    fn from(status: tonic::Status) -> Self {
        PluginError::Register(Box::new(status))
    }
}
