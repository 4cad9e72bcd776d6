// ABOUTME: Error types for command-line parsing using thiserror.
// ABOUTME: Covers empty commands and unterminated quoted spans.

use thiserror::Error;

/// Errors produced while splitting a service command line into tokens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    /// The command string was empty or contained only whitespace.
    #[error("command line is empty")]
    Empty,

    /// A quote was opened and never closed.
    #[error("unterminated {quote} quote starting at byte {position}")]
    UnterminatedQuote { quote: char, position: usize },
}
