//! Fatal-error taxonomy
//!
//! Every error that terminates a run falls into one of the classes below.
//! Transient conditions (zero-byte transfers, EAGAIN/EINTR on submit,
//! cancel failures during shutdown) are logged and recovered at the site
//! where they occur; malformed commands on the control channel are reported
//! and ignored. Only the variants here propagate to the program exit path.

use thiserror::Error;

/// Errors that abort the run with exit code 1
#[derive(Debug, Error)]
pub enum Fault {
    /// Invalid flag combination or out-of-range startup value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Target file could not be created, validated, or opened
    #[error("setup failed: {0}")]
    Setup(String),

    /// A read, write, or submit syscall returned a hard error
    #[error("io fault: {0}")]
    Io(String),

    /// An internal consistency check failed; indicates a bug
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let err = Fault::Config("iodepth out of range".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: iodepth out of range"
        );

        let err = Fault::Invariant("in-flight offsets exceed cap".to_string());
        assert!(err.to_string().starts_with("invariant violated"));
    }
}
