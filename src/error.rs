use thiserror::Error;

/// Error kinds surfaced across the runtime kernel and CLI.
///
/// Mirrors the kinds enumerated in the design doc's error handling section: most
/// call sites construct one of these directly rather than propagating a bare
/// `anyhow::Error`, so that `main` can map a failure to the right log phrasing
/// and exit code.
#[derive(Debug, Error)]
pub enum ShoeboxError {
    #[error("config error: {0}")]
    Config(String),

    #[error("dockerfile parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("child process killed by signal {0}")]
    ChildSignaled(i32),

    #[error("child process exited with status {0}")]
    ChildExited(i32),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ShoeboxError {
    /// Byte-masked exit code a caller should propagate for this error, matching
    /// the CLI's "child-subcommand failures surface the child's byte-masked exit
    /// code" contract. Signals are reported as 128+n, matching shell convention.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShoeboxError::ChildSignaled(n) => 128 + n,
            ShoeboxError::ChildExited(n) => *n,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
