//! Route commands
//!
//! OpenVPN reports every routing-table mutation it performs at connect
//! time as a shell line such as `route add -net 10.0.0.0 255.255.255.0 10.8.0.1`
//! or `/sbin/ip route add 10.0.0.0/8 via 10.8.0.1`. Pausing the VPN removes
//! those routes again; resuming re-adds them.
//!
//! The inverse is computed on the parsed token list: only the verb token is
//! swapped (`add` -> `delete`), so arguments that merely contain the letters
//! `add` (paths, interface names) are never touched.

use std::fmt;

const VERB_ADD: &str = "add";
const VERB_DELETE: &str = "delete";

/// Routing operation carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// A parsed route command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCommand {
    /// Program to execute (`route`, `/sbin/ip`, ...)
    program: String,
    /// Arguments, verbatim
    args: Vec<String>,
    /// Position of the `add`/`delete` verb inside `args`, if any
    verb_index: Option<usize>,
}

impl RouteCommand {
    /// Split a recorded route line into program and arguments.
    ///
    /// The line must hold a program followed by at least one argument. It
    /// does not need a verb; only [`RouteCommand::inverse`] does.
    pub fn parse(line: &str) -> Result<Self, RouteParseError> {
        let line = line.trim();
        let (program, rest) = match line.split_once(char::is_whitespace) {
            Some((program, rest)) if !rest.trim().is_empty() => (program, rest),
            _ => return Err(RouteParseError::MissingArguments(line.to_string())),
        };

        let args: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
        let verb_index = args
            .iter()
            .position(|a| a.eq_ignore_ascii_case(VERB_ADD) || a.eq_ignore_ascii_case(VERB_DELETE));

        Ok(Self {
            program: program.to_string(),
            args,
            verb_index,
        })
    }

    /// Program token
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument tokens
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Operation named by the verb token, if the command has one
    pub fn op(&self) -> Option<RouteOp> {
        let verb = &self.args[self.verb_index?];
        if verb.eq_ignore_ascii_case(VERB_ADD) {
            Some(RouteOp::Add)
        } else {
            Some(RouteOp::Delete)
        }
    }

    /// Command that undoes this one.
    ///
    /// Fails with [`RouteParseError::MissingVerb`] when the command carries
    /// no `add`/`delete` token to swap.
    pub fn inverse(&self) -> Result<Self, RouteParseError> {
        let index = self
            .verb_index
            .ok_or_else(|| RouteParseError::MissingVerb(self.to_string()))?;

        let current = &self.args[index];
        let verb = if current.eq_ignore_ascii_case(VERB_ADD) {
            VERB_DELETE
        } else {
            VERB_ADD
        };

        let mut args = self.args.clone();
        // Keep the platform's casing (Windows route.exe prints `ADD`)
        args[index] = if current.chars().all(|c| c.is_ascii_uppercase()) {
            verb.to_ascii_uppercase()
        } else {
            verb.to_string()
        };

        Ok(Self {
            program: self.program.clone(),
            args,
            verb_index: self.verb_index,
        })
    }
}

impl fmt::Display for RouteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Route command parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteParseError {
    #[error("Failed to parse route-change command (no arguments): {0}")]
    MissingArguments(String),

    #[error("Cannot invert route-change command (no 'add' verb): {0}")]
    MissingVerb(String),
}
