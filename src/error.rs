/// Error types used by multiple modules.
///
/// There are two error types that are used widely within the Otto BGP
/// library.
///
/// The most important is [`Failed`]. This error indicates that an
/// operation had to be canceled for some reason and callers can assume
/// that all diagnostic information has been logged and they need not do
/// anything further.
///
/// Secondly, [`ExitError`] is used when the program should be terminated. It
/// provides enough information to determine the exit code of the program.

use log::error;


//------------ Failed --------------------------------------------------------

/// An operation has failed to complete.
///
/// This error types is used to indicate that an operation has failed,
/// diagnostic information has been printed or logged, and the caller can’t
/// really do anything to recover.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Failed;


//------------ ExitError -----------------------------------------------------

/// An error happened that should lead to terminating the program.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitError {
    /// Something has happened.
    ///
    /// This should be exit status 1.
    Generic,

    /// A guardrail or input validation blocked the run.
    ///
    /// This should be exit status 2.
    SafetyBlock,

    /// Applying configuration failed and the router was rolled back.
    ///
    /// This should be exit status 3.
    ApplyFailed,

    /// The RPKI preflight check failed.
    ///
    /// This should be exit status 4.
    RpkiPreflight,
}

impl ExitError {
    /// Returns the process exit code for this error.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitError::Generic => 1,
            ExitError::SafetyBlock => 2,
            ExitError::ApplyFailed => 3,
            ExitError::RpkiPreflight => 4,
        }
    }
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        error!("Fatal error. Exiting.");
        ExitError::Generic
    }
}
