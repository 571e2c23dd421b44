// File: src/errors.rs
//
// Error handling and reporting for the Spool dialogue runtime.
// Provides a structured error type with a small set of error kinds
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Categories of errors that can occur while loading or running dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The compiled program could not be decoded, or an instruction
    /// carries the wrong operands for its opcode
    MalformedProgram,
    /// The program asked the VM to do something its current state cannot
    /// support (empty-stack pop, missing label, type-mismatched pop, ...)
    RuntimeViolation,
    /// The host called into the VM with arguments or at a time the state
    /// machine does not allow
    HostInput,
    /// A program, line database, or save file could not be read or written
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::MalformedProgram => write!(f, "Malformed Program"),
            ErrorKind::RuntimeViolation => write!(f, "Runtime Violation"),
            ErrorKind::HostInput => write!(f, "Host Input Error"),
            ErrorKind::Io => write!(f, "IO Error"),
        }
    }
}

/// A structured runtime error
#[derive(Debug, Clone)]
pub struct DialogueError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DialogueError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Create a malformed-program error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedProgram, message)
    }

    /// Create a runtime state violation error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeViolation, message)
    }

    /// Create a host-input error
    pub fn host_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostInput, message)
    }

    /// Create an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Print the error to stderr as a non-fatal warning.
    /// Used by the lax error policy when a failure is skipped instead of
    /// surfaced to the host.
    pub fn warn(&self) {
        eprintln!("{}: {}", format!("{}", self.kind).yellow().bold(), self.message);
    }
}

impl fmt::Display for DialogueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        write!(f, "{}: {}", kind_str.red().bold(), self.message.bold())
    }
}

impl std::error::Error for DialogueError {}

impl From<std::io::Error> for DialogueError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<csv::Error> for DialogueError {
    fn from(err: csv::Error) -> Self {
        Self::io(format!("csv: {}", err))
    }
}

impl From<prost::DecodeError> for DialogueError {
    fn from(err: prost::DecodeError) -> Self {
        Self::malformed(format!("program decode: {}", err))
    }
}

impl From<serde_json::Error> for DialogueError {
    fn from(err: serde_json::Error) -> Self {
        Self::io(format!("json: {}", err))
    }
}
