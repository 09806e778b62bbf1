use camino::Utf8PathBuf;
use std::fmt;
use thiserror::Error;

/// One dispatcher command, parsed from positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Info,
    Open { path: Utf8PathBuf },
    Mark { entity: Option<String> },
    Update { entity: String, text: String },
    List,
    Red { x: f64, y: f64 },
    Save { path: Utf8PathBuf },
}

/// Reasons an argument vector does not form a [`Command`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("No command specified")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Missing arguments for '{command}'. Expected: {expected}")]
    MissingArguments {
        command: &'static str,
        expected: &'static str,
    },

    #[error("Invalid coordinates: X={x}, Y={y}")]
    InvalidCoordinates { x: String, y: String },
}

impl CommandError {
    /// Unknown and missing-argument errors are followed by the usage text.
    pub fn shows_usage(&self) -> bool {
        !matches!(self, CommandError::InvalidCoordinates { .. })
    }
}

impl Command {
    /// Parse `command arg...`.
    ///
    /// For `update` (and `mark`) every argument after the entity name is
    /// re-joined with single spaces, so unquoted multi-word text survives.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, CommandError> {
        let (name, rest) = args.split_first().ok_or(CommandError::Empty)?;
        let rest: Vec<&str> = rest.iter().map(AsRef::as_ref).collect();

        match name.as_ref().to_lowercase().as_str() {
            "info" => Ok(Command::Info),
            "open" => {
                let path = rest.first().ok_or(CommandError::MissingArguments {
                    command: "open",
                    expected: "<file.ezd>",
                })?;
                Ok(Command::Open {
                    path: Utf8PathBuf::from(*path),
                })
            }
            "mark" => Ok(Command::Mark {
                entity: (!rest.is_empty()).then(|| rest.join(" ")),
            }),
            "update" => {
                if rest.len() < 2 {
                    return Err(CommandError::MissingArguments {
                        command: "update",
                        expected: "<entity> <text>",
                    });
                }
                Ok(Command::Update {
                    entity: rest[0].to_string(),
                    text: rest[1..].join(" "),
                })
            }
            "list" => Ok(Command::List),
            "red" => {
                if rest.len() < 2 {
                    return Err(CommandError::MissingArguments {
                        command: "red",
                        expected: "<x> <y>",
                    });
                }
                match (parse_coordinate(rest[0]), parse_coordinate(rest[1])) {
                    (Some(x), Some(y)) => Ok(Command::Red { x, y }),
                    _ => Err(CommandError::InvalidCoordinates {
                        x: rest[0].to_string(),
                        y: rest[1].to_string(),
                    }),
                }
            }
            "save" => {
                let path = rest.first().ok_or(CommandError::MissingArguments {
                    command: "save",
                    expected: "<file.ezd>",
                })?;
                Ok(Command::Save {
                    path: Utf8PathBuf::from(*path),
                })
            }
            _ => Err(CommandError::Unknown(name.as_ref().to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Info => "info",
            Command::Open { .. } => "open",
            Command::Mark { .. } => "mark",
            Command::Update { .. } => "update",
            Command::List => "list",
            Command::Red { .. } => "red",
            Command::Save { .. } => "save",
        }
    }

    /// Commands that touch the open document.
    pub fn requires_session(&self) -> bool {
        !matches!(self, Command::Info | Command::Open { .. })
    }

    /// Positional arguments that [`Command::parse`] turns back into `self`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            Command::Info | Command::List => {}
            Command::Open { path } | Command::Save { path } => args.push(path.to_string()),
            Command::Mark { entity } => args.extend(entity.clone()),
            Command::Update { entity, text } => {
                args.push(entity.clone());
                args.push(text.clone());
            }
            Command::Red { x, y } => {
                args.push(x.to_string());
                args.push(y.to_string());
            }
        }
        args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

fn parse_coordinate(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Usage text printed after unknown or incomplete commands.
pub const USAGE: &str = "\
Usage: ezcad-bridge [--library <MarkEzd.dll>] [--document <file.ezd>] <command> [args...]

Commands:
  info                      Show bridge environment information
  open <file.ezd>           Open an EZD file
  mark [entity]             Mark one entity, or all entities when omitted
  update <entity> <text>    Replace the text of an entity
  list                      List entities in the open file
  red <x> <y>               Position the red light pointer
  save <file.ezd>           Save the open file";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_rejoins_text() {
        let command = Command::parse(&["update", "E", "a", "b", "c"]).unwrap();
        assert_eq!(
            command,
            Command::Update {
                entity: "E".to_string(),
                text: "a b c".to_string()
            }
        );
    }

    #[test]
    fn test_parse_update_keeps_quoted_text() {
        let command = Command::parse(&["update", "Serial", "SN  100001"]).unwrap();
        assert_eq!(
            command,
            Command::Update {
                entity: "Serial".to_string(),
                text: "SN  100001".to_string()
            }
        );
    }

    #[test]
    fn test_parse_update_missing_text() {
        let err = Command::parse(&["update", "E"]).unwrap_err();
        assert!(matches!(err, CommandError::MissingArguments { command: "update", .. }));
        assert!(err.shows_usage());
    }

    #[test]
    fn test_parse_mark_optional_entity() {
        assert_eq!(Command::parse(&["mark"]).unwrap(), Command::Mark { entity: None });
        assert_eq!(
            Command::parse(&["mark", "Logo"]).unwrap(),
            Command::Mark {
                entity: Some("Logo".to_string())
            }
        );
    }

    #[test]
    fn test_parse_red_coordinates() {
        assert_eq!(
            Command::parse(&["red", "10.5", "-3"]).unwrap(),
            Command::Red { x: 10.5, y: -3.0 }
        );

        let err = Command::parse(&["red", "abc", "1"]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid coordinates: X=abc, Y=1");
        assert!(!err.shows_usage());

        assert!(Command::parse(&["red", "NaN", "1"]).is_err());
    }

    #[test]
    fn test_parse_unknown_and_empty() {
        let empty: [&str; 0] = [];
        assert_eq!(Command::parse(&empty).unwrap_err(), CommandError::Empty);
        assert_eq!(
            Command::parse(&["burn"]).unwrap_err(),
            CommandError::Unknown("burn".to_string())
        );
    }

    #[test]
    fn test_command_names_are_case_insensitive() {
        assert_eq!(Command::parse(&["LIST"]).unwrap(), Command::List);
    }

    #[test]
    fn test_requires_session() {
        assert!(!Command::Info.requires_session());
        assert!(
            !Command::Open {
                path: Utf8PathBuf::from("a.ezd")
            }
            .requires_session()
        );
        assert!(Command::List.requires_session());
        assert!(Command::Mark { entity: None }.requires_session());
    }

    #[test]
    fn test_to_args_reparses() {
        let command = Command::Update {
            entity: "Text1".to_string(),
            text: "Hello world".to_string(),
        };
        assert_eq!(Command::parse(&command.to_args()).unwrap(), command);
        assert_eq!(command.to_string(), "update Text1 Hello world");
    }
}
