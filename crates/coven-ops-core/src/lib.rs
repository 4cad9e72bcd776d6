// ABOUTME: Shared types and configuration for coven-ops.
// ABOUTME: Contains config parsing, service definitions, and the command-line parser.

pub mod command;
pub mod config;
pub mod error;

pub use command::{parse_command, CommandLine};
pub use config::{OpsConfig, ServiceConfig, ServiceKind};
pub use error::CommandParseError;
