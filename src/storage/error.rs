use crate::process::ProcessError;

/// Failures surfaced by the storage engine and the object parser.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] ProcessError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("repository is not valid: {0}")]
    RepoNotValid(String),

    #[error("invalid repository id {0:?}")]
    InvalidId(String),

    #[error("git {command} exited with {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("git {0} timed out")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the failure means the repository or revision does not exist,
    /// as opposed to something going wrong while serving it.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::RepoNotValid(_) | Self::InvalidId(_)
        )
    }
}

impl From<ProcessError> for StorageError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Spawn { .. } => Self::Spawn(err),
            ProcessError::Cancelled { .. } => Self::Cancelled,
            ProcessError::Wait { program, source } | ProcessError::Io { program, source } => {
                Self::io(program, source)
            }
        }
    }
}
