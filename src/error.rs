//
// Copyright (c) 2025-2026 Jeff Garzik
//
// This file is part of the ptdd-rs project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT
//

use std::fmt;
use std::io;

use crate::pt::PtStatus;

/// Error type for ptdd operations
///
/// Each variant maps onto one of the exit-code categories reported to the
/// shell, so errors can be carried up from deep inside the copy loop and
/// still produce the right process status.
#[derive(Debug)]
pub enum PtddError {
    /// I/O error without a more specific category
    Io(io::Error),
    /// Bad command line option or operand
    Syntax(String),
    /// Failure to open, seek, lock or size a file
    File(String),
    /// Advisory lock could not be obtained
    Flock(String),
    /// Unrecovered medium error (or coe_limit exceeded)
    Medium(String),
    /// A pass-through command failed; category passed through unmodified
    Pt(PtStatus, String),
    /// Any other failure
    Other(String),
}

impl fmt::Display for PtddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtddError::Io(e) => write!(f, "I/O error: {}", e),
            PtddError::Syntax(msg) => write!(f, "{}", msg),
            PtddError::File(msg) => write!(f, "{}", msg),
            PtddError::Flock(msg) => write!(f, "{}", msg),
            PtddError::Medium(msg) => write!(f, "{}", msg),
            PtddError::Pt(status, msg) => write!(f, "{} ({})", msg, status),
            PtddError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PtddError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PtddError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PtddError {
    fn from(err: io::Error) -> Self {
        PtddError::Io(err)
    }
}

/// Result type for ptdd operations
pub type PtddResult<T> = Result<T, PtddError>;

/// Process exit codes, one per error category.
pub const EXIT_SYNTAX: u8 = 1;
pub const EXIT_FILE_ERROR: u8 = 2;
pub const EXIT_MEDIUM_HARD: u8 = 3;
pub const EXIT_CAT_OTHER: u8 = 4;
pub const EXIT_UNIT_ATTENTION: u8 = 5;
pub const EXIT_ABORTED_COMMAND: u8 = 6;
pub const EXIT_INVALID_OP: u8 = 7;
pub const EXIT_NOT_READY: u8 = 8;
pub const EXIT_PROTECTION: u8 = 9;
pub const EXIT_FLOCK: u8 = 10;

impl PtddError {
    /// Exit code for this error, per category
    pub fn exit_code(&self) -> u8 {
        match self {
            PtddError::Io(_) | PtddError::Other(_) => EXIT_CAT_OTHER,
            PtddError::Syntax(_) => EXIT_SYNTAX,
            PtddError::File(_) => EXIT_FILE_ERROR,
            PtddError::Flock(_) => EXIT_FLOCK,
            PtddError::Medium(_) => EXIT_MEDIUM_HARD,
            PtddError::Pt(status, _) => status.exit_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PtddError::Syntax("x".into()).exit_code(), EXIT_SYNTAX);
        assert_eq!(PtddError::File("x".into()).exit_code(), EXIT_FILE_ERROR);
        assert_eq!(PtddError::Medium("x".into()).exit_code(), EXIT_MEDIUM_HARD);
        assert_eq!(
            PtddError::Pt(PtStatus::NotReady, "x".into()).exit_code(),
            EXIT_NOT_READY
        );
        assert_eq!(
            PtddError::Io(std::io::Error::other("x")).exit_code(),
            EXIT_CAT_OTHER
        );
    }
}
