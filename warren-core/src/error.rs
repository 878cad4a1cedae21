//! Error types for Warren

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Warren error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Namespace operation failed
    #[error("Namespace error: {message}")]
    Namespace {
        /// Error message
        message: String,
    },

    /// A file exists at the mount point but it is not a namespace
    #[error("{} is not a network namespace", .path.display())]
    NotNamespace {
        /// Offending path
        path: PathBuf,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// A user-space networking helper failed
    #[error("{helper} failed: {message}")]
    Helper {
        /// Helper binary name
        helper: &'static str,
        /// Error message
        message: String,
    },

    /// Symlink chain did not terminate within the hop limit
    #[error("too many symlinks while resolving {}", .path.display())]
    TooManySymlinks {
        /// Path being resolved
        path: PathBuf,
    },

    /// Error annotated with the rootless netns operation that produced it
    #[error("rootless netns: {}{source}", fmt_context(.context))]
    Context {
        /// Operation name, may be empty
        context: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Several independent steps failed
    #[error(transparent)]
    Multiple(#[from] MultiError),
}

fn fmt_context(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!("{context}: ")
    }
}

impl Error {
    /// Wrap an error with the name of the failed operation.
    ///
    /// The rendered message always starts with `rootless netns:`, so
    /// `context` must not repeat it. An empty context only adds the prefix.
    pub fn wrap(context: impl Into<String>, err: impl Into<Self>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(err.into()),
        }
    }

    /// Create a namespace error from a message
    pub fn namespace(message: impl Into<String>) -> Self {
        Self::Namespace {
            message: message.into(),
        }
    }

    /// Create a configuration error from a message
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if the root cause is a missing file
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::System(errno) => *errno == nix::errno::Errno::ENOENT,
            Self::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Extension trait adding rootless netns context to results
pub trait WrapErr<T> {
    /// Wrap the error, see [`Error::wrap`]
    ///
    /// # Errors
    /// Returns the wrapped error if `self` is `Err`
    fn wrap_err(self, context: &str) -> Result<T>;
}

impl<T, E: Into<Error>> WrapErr<T> for std::result::Result<T, E> {
    fn wrap_err(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::wrap(context, e))
    }
}

/// Collection of errors from steps that are all attempted regardless of
/// earlier failures
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn push(&mut self, err: impl Into<Error>) {
        self.errors.push(err.into());
    }

    /// Record the error of a result, if any
    pub fn check(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.push(e);
        }
    }

    /// Number of errors collected
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Check if nothing failed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected errors
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok` if nothing failed, the lone error if one failed, otherwise all of them
    ///
    /// # Errors
    /// Returns the collected error(s)
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Result type alias for Warren operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_format() {
        let err = Error::wrap("create netns", Error::namespace("boom"));
        assert_eq!(
            err.to_string(),
            "rootless netns: create netns: Namespace error: boom"
        );
    }

    #[test]
    fn test_wrap_empty_context() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::wrap("", io);
        assert_eq!(err.to_string(), "rootless netns: I/O error: denied");
    }

    #[test]
    fn test_not_found_through_context() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err: Result<()> = Err::<(), _>(io).wrap_err("read pid file");
        assert!(err.unwrap_err().is_not_found());

        let errno = Error::wrap("unmount", nix::errno::Errno::ENOENT);
        assert!(errno.is_not_found());
        assert!(!Error::namespace("x").is_not_found());
    }

    #[test]
    fn test_multi_error_collapse() {
        let empty = MultiError::new();
        assert!(empty.into_result().is_ok());

        let mut one = MultiError::new();
        one.push(Error::namespace("only"));
        let err = one.into_result().unwrap_err();
        assert!(matches!(err, Error::Namespace { .. }));
    }

    #[test]
    fn test_multi_error_display() {
        let mut errs = MultiError::new();
        errs.check(Ok(()));
        errs.check(Err(Error::namespace("first")));
        errs.push(Error::invalid_config("second"));
        assert_eq!(errs.len(), 2);

        let msg = errs.into_result().unwrap_err().to_string();
        assert!(msg.starts_with("2 errors occurred:"));
        assert!(msg.contains("\t* Namespace error: first"));
        assert!(msg.contains("\t* Invalid configuration: second"));
    }
}
