use thiserror::Error;

#[derive(Error, Debug)]
pub enum NbpError {
    #[error("Command '{cmd}' exited with status {status}: {output}")]
    Command {
        cmd: String,
        status: i32,
        output: String,
    },
    #[error("Failed to start command '{cmd}': {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },
    #[error("Could not connect volume: device '{path}' did not appear after {attempts} attempts.")]
    DeviceTimeout { path: String, attempts: u32 },

    #[error("No such instance '{0}' exists.")]
    NoInstance(String),
    #[error("Instance '{0}' already exists.")]
    InstanceExists(String),
    #[error("Volume id not provided in credential info of instance '{0}'.")]
    NoVolumeId(String),
    #[error("Volume attachment id not provided in credential info of instance '{0}'.")]
    NoAttachmentId(String),
    #[error("Instance '{0}' is still bound, unbind it first.")]
    InstanceBound(String),
    #[error("Instance '{0}' is already bound.")]
    AlreadyBound(String),

    #[error("{0} is not implemented.")]
    NotImplemented(String),
}

/// Coarse classes a protocol layer maps onto its own response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ExternalTool,
    Timeout,
    NotFound,
    Conflict,
    NotImplemented,
    ControlPlane,
}

impl NbpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NbpError::Command { .. } | NbpError::Spawn { .. } => ErrorKind::ExternalTool,
            NbpError::DeviceTimeout { .. } => ErrorKind::Timeout,
            NbpError::NoInstance(_) | NbpError::NoVolumeId(_) | NbpError::NoAttachmentId(_) => {
                ErrorKind::NotFound
            }
            NbpError::InstanceExists(_)
            | NbpError::InstanceBound(_)
            | NbpError::AlreadyBound(_) => ErrorKind::Conflict,
            NbpError::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }
}

/// Classifies an error returned by this crate. Anything that is not an
/// `NbpError` came from the storage control plane untouched.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    match err.downcast_ref::<NbpError>() {
        Some(e) => e.kind(),
        None => ErrorKind::ControlPlane,
    }
}
