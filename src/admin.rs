//! Free-text administrative commands, e.g. `ADMIN LIMIT 5`.
//!
//! Commands are matched case-insensitively. Supported commands:
//!
//! - `ADMIN LIMIT <n>`: set the concurrency limit to the positive integer `n`.
//! - `ADMIN STATUS`: report the number of running and waiting jobs.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{controller::Owner, AdmissionController, ConfigError, Limit};

const ADMIN: &str = "ADMIN";
const LIMIT: &str = "LIMIT";
const STATUS: &str = "STATUS";

/// A parsed administrative command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Change the concurrency limit.
    SetLimit(Limit),
    /// Report the controller's state.
    Status,
}

/// Why a command couldn't be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Doesn't start with `ADMIN`.
    #[error("not an admin command")]
    NotAdmin,

    /// An `ADMIN` command we don't know.
    #[error("unknown admin command {0:?}, expected LIMIT <number> or STATUS")]
    Unknown(String),

    /// `ADMIN LIMIT` without exactly one argument.
    #[error("usage: ADMIN LIMIT <number>")]
    LimitUsage,

    /// `ADMIN LIMIT` with an invalid limit.
    #[error("invalid limit: {0}")]
    InvalidLimit(#[from] ConfigError),
}

/// The result of [apply_admin_command](AdmissionController::apply_admin_command), with a message
/// to relay to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command was applied.
    Success(String),
    /// The command was rejected. Nothing changed.
    Failure(String),
}

impl FromStr for AdminCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();

        match tokens.next() {
            Some(keyword) if keyword.eq_ignore_ascii_case(ADMIN) => {}
            _ => return Err(CommandError::NotAdmin),
        }

        let command = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        if command.eq_ignore_ascii_case(LIMIT) {
            match args.as_slice() {
                [limit] => Ok(AdminCommand::SetLimit(limit.parse()?)),
                _ => Err(CommandError::LimitUsage),
            }
        } else if command.eq_ignore_ascii_case(STATUS) && args.is_empty() {
            Ok(AdminCommand::Status)
        } else {
            Err(CommandError::Unknown(s.trim().to_owned()))
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::SetLimit(limit) => write!(f, "{ADMIN} {LIMIT} {limit}"),
            AdminCommand::Status => write!(f, "{ADMIN} {STATUS}"),
        }
    }
}

impl CommandOutcome {
    /// Whether the command was applied.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success(_))
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            CommandOutcome::Success(message) | CommandOutcome::Failure(message) => message,
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl<O: Owner> AdmissionController<O> {
    /// Parse and apply a free-text admin command.
    ///
    /// Never fails: problems are reported as a [CommandOutcome::Failure].
    pub fn apply_admin_command(&self, command: &str) -> CommandOutcome {
        let command = match command.parse::<AdminCommand>() {
            Ok(command) => command,
            Err(e) => return CommandOutcome::Failure(capitalise(&e.to_string())),
        };

        match command {
            AdminCommand::SetLimit(limit) => {
                let old_limit = self.limit();
                match self.set_limit(limit) {
                    Ok(new_limit) => CommandOutcome::Success(format!(
                        "Concurrency limit set to {new_limit} (was {old_limit})."
                    )),
                    Err(e) => CommandOutcome::Failure(capitalise(&e.to_string())),
                }
            }
            AdminCommand::Status => {
                let state = self.state();
                CommandOutcome::Success(format!(
                    "Running {}/{} jobs, {} waiting.",
                    state.running().len(),
                    state.limit(),
                    state.waiting().len()
                ))
            }
        }
    }
}

fn capitalise(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
