use std::io::Write;

use dbdeck_core::backend::SessionBackend;
use dbdeck_core::profiles::NewProfile;
use dbdeck_core::storage::KeyValueStorage;
use dbdeck_core::workspace::Workspace;
use serde::Serialize;
use thiserror::Error;

pub const HELP: &str = "commands: profiles | add <name> <host> <port> <user> <password> [database] \
| delete <id> | connect <id> | use <id> <database> | select <database> [collection] \
| run <query...> | templates | disconnect | view | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Profiles,
    Add(NewProfile),
    Delete(String),
    Connect(String),
    Use { id: String, database: String },
    Select {
        database: String,
        collection: Option<String>,
    },
    Run(String),
    Templates,
    Disconnect,
    View,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid port `{0}`")]
    InvalidPort(String),
}

/// Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    let Some((name, rest)) = split_word(line) else {
        return Ok(None);
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match name {
        "profiles" => Command::Profiles,
        "add" => {
            let [name, host, port, user, password, database @ ..] = args.as_slice() else {
                return Err(CommandError::Usage(
                    "add <name> <host> <port> <user> <password> [database]",
                ));
            };
            let port = port
                .parse::<u16>()
                .map_err(|_| CommandError::InvalidPort((*port).to_string()))?;
            let mut profile = NewProfile::new(*name, *host, *user);
            profile.port = port;
            profile.password = (*password).to_string();
            profile.database = database.first().map(|database| (*database).to_string());
            Command::Add(profile)
        }
        "delete" => Command::Delete(single_arg(&args, "delete <id>")?),
        "connect" => Command::Connect(single_arg(&args, "connect <id>")?),
        "use" => match args.as_slice() {
            [id, database] => Command::Use {
                id: (*id).to_string(),
                database: (*database).to_string(),
            },
            _ => return Err(CommandError::Usage("use <id> <database>")),
        },
        "select" => match args.as_slice() {
            [database] => Command::Select {
                database: (*database).to_string(),
                collection: None,
            },
            [database, collection] => Command::Select {
                database: (*database).to_string(),
                collection: Some((*collection).to_string()),
            },
            _ => return Err(CommandError::Usage("select <database> [collection]")),
        },
        "run" if rest.trim().is_empty() => return Err(CommandError::Usage("run <query...>")),
        "run" => Command::Run(rest.trim().to_string()),
        "templates" => Command::Templates,
        "disconnect" => Command::Disconnect,
        "view" => Command::View,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn split_word(line: &str) -> Option<(&str, &str)> {
    if line.is_empty() {
        return None;
    }
    Some(line.split_once(char::is_whitespace).unwrap_or((line, "")))
}

fn single_arg(args: &[&str], usage: &'static str) -> Result<String, CommandError> {
    match args {
        [value] => Ok((*value).to_string()),
        _ => Err(CommandError::Usage(usage)),
    }
}

/// Applies one command and prints its effect as pretty JSON. Returns `false`
/// once the shell should stop.
pub async fn run_command<B, S>(
    workspace: &mut Workspace<B, S>,
    command: Command,
    out: &mut impl Write,
) -> Result<bool, Box<dyn std::error::Error>>
where
    B: SessionBackend + 'static,
    S: KeyValueStorage,
{
    match command {
        Command::Profiles => print_json(out, &workspace.view().tree.profiles())?,
        Command::Add(profile) => {
            let mut saved = workspace.request_add_profile(profile)?;
            saved.password.clear();
            print_json(out, &saved)?;
        }
        Command::Delete(id) => {
            let removed = workspace.request_delete_profile(&id).await?;
            print_json(out, &serde_json::json!({ "deleted": removed, "id": id }))?;
        }
        Command::Connect(id) => {
            // Failures are already recorded as the view's last result.
            let _ = workspace.request_connect(&id).await;
            print_json(out, &workspace.view())?;
        }
        Command::Use { id, database } => {
            let _ = workspace.request_switch_database(&id, &database).await;
            print_json(out, &workspace.view())?;
        }
        Command::Select {
            database,
            collection,
        } => {
            workspace.request_select(&database, collection.as_deref());
            print_json(out, &workspace.view().selection)?;
        }
        Command::Run(query) => {
            let outcome = workspace.request_execute(&query).await;
            print_json(out, outcome)?;
        }
        Command::Templates => print_json(out, &workspace.templates().all())?,
        Command::Disconnect => {
            workspace.request_disconnect().await;
            print_json(out, &workspace.view())?;
        }
        Command::View => print_json(out, &workspace.view())?,
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_json(out: &mut impl Write, value: &impl Serialize) -> std::io::Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    writeln!(out, "{rendered}")
}
