use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of [`crate::process::ProcessRunner`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program} {args}` exited with {status}: {stderr}")]
    NonZeroExit {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },
}

/// Failure modes of [`crate::catalog::RemoteCatalog`].
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("remote catalog row has unexpected arity ({0} fields): {1:?}")]
    MalformedRow(usize, Vec<String>),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Failure modes surfaced, but absorbed, while checking a single submodule or module file.
#[derive(Debug, Error)]
pub enum SubmoduleError {
    #[error("failed to read module file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("git operation failed while updating submodule {submodule}: {source}")]
    Git {
        submodule: String,
        #[source]
        source: ProcessError,
    },
}
