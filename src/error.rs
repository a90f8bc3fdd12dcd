use std::fmt;

use thiserror::Error;

/// Recoverable failures surfaced to the embedder.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to map {name} ({size} bytes): {source}")]
    Map {
        name: &'static str,
        size: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} failed on [{begin:#x}, {end:#x}): {source}")]
    Syscall {
        op: &'static str,
        begin: usize,
        end: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} at {addr:#x} failed: {err}")]
    Ioctl {
        op: &'static str,
        addr: usize,
        err: IoctlError,
    },
    #[error("userfaultfd is unavailable: {0}")]
    UffdUnavailable(String),
    #[error("address {0:#x} does not belong to any managed region")]
    UnknownAddress(usize),
    #[error("{space} is out of memory allocating {size} bytes")]
    OutOfMemory { space: &'static str, size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn syscall(op: &'static str, begin: usize, len: usize) -> Self {
        Error::Syscall {
            op,
            begin,
            end: begin + len,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Outcome of a single userfaultfd page-installation ioctl that did not complete.
///
/// The progress carried by `Again` and `Exists` is the number of bytes the kernel installed
/// before it stopped, so callers retry from `start + progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoctlError {
    #[error("EAGAIN after {0} bytes")]
    Again(usize),
    #[error("EEXIST after {0} bytes")]
    Exists(usize),
    #[error("ENOENT")]
    NoEnt,
    #[error("errno {0}")]
    Errno(i32),
}

/// An internal invariant of the collector does not hold. Heap contents can no longer be trusted,
/// so the only response is to stop the process.
#[derive(Error)]
#[error("invariant violation: {message}")]
pub struct InvariantViolation {
    message: String,
}

impl InvariantViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    #[cold]
    pub fn abort(self) -> ! {
        log::error!("{}", self);
        eprintln!("{}\n{:?}", self, backtrace::Backtrace::new());
        std::process::abort()
    }
}

impl fmt::Debug for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvariantViolation({:?})", self.message)
    }
}

/// Turns a failure of an operation the collector cannot continue without into an abort.
pub trait OrFatal<T> {
    fn or_fatal(self, what: &str) -> T;
}

impl<T, E: fmt::Display> OrFatal<T> for std::result::Result<T, E> {
    #[inline]
    fn or_fatal(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => InvariantViolation::new(format!("{}: {}", what, err)).abort(),
        }
    }
}

#[macro_export]
macro_rules! gc_fatal {
    ($($t:tt)*) => {
        $crate::error::InvariantViolation::new(format!($($t)*)).abort()
    };
}

#[macro_export]
macro_rules! gc_check {
    ($cond: expr, $($t:tt)*) => {
        if !$cond {
            $crate::gc_fatal!($($t)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_errors_render_progress() {
        assert_eq!(IoctlError::Again(8192).to_string(), "EAGAIN after 8192 bytes");
        let err = Error::Ioctl {
            op: "UFFDIO_COPY",
            addr: 0x1000,
            err: IoctlError::Errno(libc::EINVAL),
        };
        assert!(err.to_string().contains("UFFDIO_COPY at 0x1000"));
    }

    #[test]
    fn invariant_violation_keeps_message() {
        let v = InvariantViolation::new("page 3 regressed");
        assert_eq!(v.message(), "page 3 regressed");
        assert_eq!(v.to_string(), "invariant violation: page 3 regressed");
    }
}
