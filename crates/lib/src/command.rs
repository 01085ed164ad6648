//! Bot command text parsing: `/name@target argument`.
//!
//! Parsing borrows from the message text; nothing is allocated.

use std::fmt;

/// A bot command parsed from message text.
///
/// For `"/start@username 1 2"`: name `start`, target suffix `username`, argument `1 2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParsedCommand<'a> {
    pub name: &'a str,
    /// Bot username after `@`, empty when the command is not addressed to a specific bot.
    pub target_suffix: &'a str,
    /// Everything after the first space, with surrounding whitespace removed.
    pub argument: &'a str,
}

impl<'a> ParsedCommand<'a> {
    /// Parse a command from message text. Text shorter than 2 bytes or not starting with `/`
    /// yields the zero value.
    pub fn parse(text: &'a str) -> Self {
        let Some(rest) = text.strip_prefix('/') else {
            return Self::default();
        };
        if rest.is_empty() {
            return Self::default();
        }

        let (head, argument) = match rest.split_once(' ') {
            Some((head, arg)) => (head, arg.trim()),
            None => (rest, ""),
        };
        let (name, target_suffix) = head.split_once('@').unwrap_or((head, ""));

        Self {
            name,
            target_suffix,
            argument,
        }
    }

    /// True for the zero value (not a command).
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.target_suffix.is_empty() && self.argument.is_empty()
    }
}

impl fmt::Display for ParsedCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name)?;
        if !self.target_suffix.is_empty() {
            write!(f, "@{}", self.target_suffix)?;
        }
        if !self.argument.is_empty() {
            write!(f, " {}", self.argument)?;
        }
        Ok(())
    }
}
