//! Error kinds that callers branch on.
//!
//! Most code returns [`anyhow::Result`]; when a failure has a meaning
//! beyond "something went wrong" the root cause is a [`VzttError`], and
//! [`error_code`] recovers the closed [`ErrorCode`] from any error chain.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use camino::Utf8PathBuf;

/// Outcome codes returned from every public entry point.  The numeric
/// values are used as process exit codes and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Generic = 1,
    Alloc = 2,
    LockTimeout = 3,
    AlreadyLocked = 4,
    CannotLock = 5,
    TemplateNotFound = 6,
    BrokenTemplate = 7,
    HasDependents = 8,
    TemplateInstalled = 9,
    TemplateNotInstalled = 10,
    NotPermitted = 11,
    Backend = 12,
    Io = 13,
    UnknownTechnology = 14,
    Unsupported = 15,
    NotUpToDate = 16,
    BadContainerState = 17,
    UpgradeTarget = 18,
    InvalidName = 19,
}

impl ErrorCode {
    pub fn as_exit_code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VzttError {
    #[error("Timed out after {timeout}s waiting for lock on {path}")]
    LockTimeout { path: Utf8PathBuf, timeout: u64 },
    #[error("{0} is already locked")]
    AlreadyLocked(String),
    #[error("Cannot lock {0}")]
    CannotLock(String),
    #[error("Template {0} not found")]
    TemplateNotFound(String),
    #[error("Broken template {name}: {reason}")]
    BrokenTemplate { name: String, reason: String },
    #[error("Template {name} has dependents: {dependents}")]
    HasDependents { name: String, dependents: String },
    #[error("Template {0} is already installed")]
    TemplateInstalled(String),
    #[error("Template {0} is not installed")]
    TemplateNotInstalled(String),
    #[error("Package operations are not permitted for template {0}")]
    NotPermitted(String),
    #[error("{backend} failed: {message}")]
    Backend { backend: String, message: String },
    #[error("Unknown technology: {0}")]
    UnknownTechnology(String),
    #[error("Operation {0} is not supported")]
    Unsupported(&'static str),
    #[error("{0} is not up to date")]
    NotUpToDate(String),
    #[error("Container {ctid}: {reason}")]
    BadContainerState { ctid: String, reason: String },
    #[error("No upgrade target for {0}")]
    UpgradeTarget(String),
    #[error("Invalid template name: {0}")]
    InvalidName(String),
}

impl VzttError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VzttError::LockTimeout { .. } => ErrorCode::LockTimeout,
            VzttError::AlreadyLocked(_) => ErrorCode::AlreadyLocked,
            VzttError::CannotLock(_) => ErrorCode::CannotLock,
            VzttError::TemplateNotFound(_) => ErrorCode::TemplateNotFound,
            VzttError::BrokenTemplate { .. } => ErrorCode::BrokenTemplate,
            VzttError::HasDependents { .. } => ErrorCode::HasDependents,
            VzttError::TemplateInstalled(_) => ErrorCode::TemplateInstalled,
            VzttError::TemplateNotInstalled(_) => ErrorCode::TemplateNotInstalled,
            VzttError::NotPermitted(_) => ErrorCode::NotPermitted,
            VzttError::Backend { .. } => ErrorCode::Backend,
            VzttError::UnknownTechnology(_) => ErrorCode::UnknownTechnology,
            VzttError::Unsupported(_) => ErrorCode::Unsupported,
            VzttError::NotUpToDate(_) => ErrorCode::NotUpToDate,
            VzttError::BadContainerState { .. } => ErrorCode::BadContainerState,
            VzttError::UpgradeTarget(_) => ErrorCode::UpgradeTarget,
            VzttError::InvalidName(_) => ErrorCode::InvalidName,
        }
    }
}

/// Find the most specific error code in the chain of `e`.
///
/// A typed [`VzttError`] anywhere in the chain wins; otherwise plain I/O
/// failures map to [`ErrorCode::Io`], and everything else is generic.
pub fn error_code(e: &anyhow::Error) -> ErrorCode {
    // anyhow's downcast sees both context values and the root cause
    let typed = e
        .downcast_ref::<VzttError>()
        .or_else(|| e.chain().find_map(|c| c.downcast_ref::<VzttError>()));
    if let Some(v) = typed {
        return v.code();
    }
    let io = e
        .downcast_ref::<std::io::Error>()
        .or_else(|| e.chain().find_map(|c| c.downcast_ref::<std::io::Error>()));
    match io {
        Some(io) if io.kind() == std::io::ErrorKind::OutOfMemory => ErrorCode::Alloc,
        Some(_) => ErrorCode::Io,
        None => ErrorCode::Generic,
    }
}
