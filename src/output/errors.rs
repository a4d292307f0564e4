// Human-readable error messages for nexus-play

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

use crate::executor::host_state::StateError;

/// Decide on color output from TTY detection and NO_COLOR
fn should_use_colors() -> bool {
    // https://no-color.org/
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    std::io::stderr().is_terminal()
}

/// All error types in nexus-play
#[derive(Debug)]
pub enum NexusError {
    /// Playbook, task file or role parse errors
    Parse(Box<ParseError>),

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },

    /// Inventory errors
    Inventory {
        message: String,
        suggestion: Option<String>,
    },

    /// A host the iterator has no state for
    InvalidHost { host: String },

    /// Role resolution errors
    Role {
        role: String,
        message: String,
        suggestion: Option<String>,
    },

    /// Host state cursor errors surfaced to a caller
    State(StateError),
}

#[derive(Debug)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub suggestion: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            suggestion: None,
        }
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn at(mut self, line: Option<usize>, column: Option<usize>) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidYaml,
    MissingField,
    InvalidValue,
}

impl NexusError {
    pub fn invalid_host(host: impl Into<String>) -> Self {
        NexusError::InvalidHost { host: host.into() }
    }

    pub fn io(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        NexusError::Io {
            message: message.into(),
            path,
        }
    }
}

impl From<ParseError> for NexusError {
    fn from(err: ParseError) -> Self {
        NexusError::Parse(Box::new(err))
    }
}

impl From<StateError> for NexusError {
    fn from(err: StateError) -> Self {
        NexusError::State(err)
    }
}

impl std::error::Error for NexusError {}

impl fmt::Display for NexusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            NexusError::Parse(err) => {
                writeln!(f, "{}: {}", "ERROR".red().bold(), err.message)?;

                if let Some(ref file) = err.file {
                    writeln!(f)?;
                    write!(f, "  {} ", "-->".blue())?;
                    write!(f, "{}", file.cyan())?;
                    if let Some(line) = err.line {
                        write!(f, ":{}", line)?;
                        if let Some(col) = err.column {
                            write!(f, ":{}", col)?;
                        }
                    }
                    writeln!(f)?;
                }

                if let Some(ref suggestion) = err.suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            NexusError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            NexusError::Inventory {
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "INVENTORY ERROR".red().bold(), message)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            NexusError::InvalidHost { host } => {
                writeln!(
                    f,
                    "{}: host '{}' is not part of this play",
                    "INVALID HOST".red().bold(),
                    host
                )
            }

            NexusError::Role {
                role,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "ROLE ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Role:".dimmed(), role)?;

                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }

                Ok(())
            }

            NexusError::State(err) => {
                writeln!(f, "{}: {}", "STATE ERROR".red().bold(), err)
            }
        }
    }
}
