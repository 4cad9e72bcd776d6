// ABOUTME: Splits a service command string into a program and its arguments.
// ABOUTME: Honours single and double quoted spans without invoking a shell.

use crate::error::CommandParseError;
use std::str::FromStr;

/// A parsed command line: the executable and the arguments passed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl FromStr for CommandLine {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_command(s)
    }
}

/// Parse a command string into tokens.
///
/// Tokens are separated by whitespace. A `"` or `'` opens a span that is
/// copied verbatim until the matching quote; the quotes themselves are
/// dropped. Quoted and unquoted text touching each other form one token, so
/// `--name="a b"` becomes `--name=a b`.
pub fn parse_command(input: &str) -> Result<CommandLine, CommandParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Tracks whether a token has started, so `""` still yields an empty argument.
    let mut in_token = false;
    let mut quote: Option<(char, usize)> = None;

    for (pos, ch) in input.char_indices() {
        match quote {
            Some((open, _)) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some((ch, pos));
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if let Some((quote, position)) = quote {
        return Err(CommandParseError::UnterminatedQuote { quote, position });
    }
    if in_token {
        tokens.push(current);
    }

    let mut tokens = tokens.into_iter();
    let program = tokens.next().ok_or(CommandParseError::Empty)?;
    Ok(CommandLine {
        program,
        args: tokens.collect(),
    })
}
