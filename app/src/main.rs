mod commands;

use std::io::Write;
use std::sync::Arc;

use dbdeck_adapters::mysql::MysqlSessionBackend;
use dbdeck_core::settings::Settings;
use dbdeck_core::storage::{FileStorage, KeyValueStorage, MemoryStorage};
use dbdeck_core::workspace::Workspace;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{parse_command, run_command, HELP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CliOptions {
    ephemeral: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    for arg in args {
        match arg.as_str() {
            "--ephemeral" => options.ephemeral = true,
            other => {
                return Err(format!(
                    "unrecognized argument `{other}`\nusage: dbdeck-app [--ephemeral]"
                ))
            }
        }
    }
    Ok(options)
}

/// Logs go to stderr so stdout carries only command output.
fn init_logging(settings: &Settings) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn serve<S>(storage: S, settings: &Settings) -> Result<(), Box<dyn std::error::Error>>
where
    S: KeyValueStorage + Clone,
{
    let backend = Arc::new(MysqlSessionBackend::new());
    let mut workspace = Workspace::new(backend, storage, settings);
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{HELP}")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(error) => {
                writeln!(stdout, "{error}")?;
                continue;
            }
        };
        if !run_command(&mut workspace, command, &mut stdout).await? {
            break;
        }
        stdout.flush()?;
    }

    workspace.request_disconnect().await;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_args(std::env::args().skip(1))?;
    let loaded = Settings::load_default();
    let settings = loaded.as_ref().cloned().unwrap_or_default();
    init_logging(&settings);
    if let Err(error) = &loaded {
        warn!(%error, "using default settings");
    }

    if options.ephemeral {
        info!("profiles and templates are kept in memory only");
        return serve(Arc::new(MemoryStorage::new()), &settings).await;
    }

    let storage = match &settings.storage_dir {
        Some(dir) => FileStorage::new(dir),
        None => FileStorage::open_default()?,
    };
    info!(dir = %storage.dir().display(), "using profile storage");
    serve(storage, &settings).await
}

#[cfg(test)]
mod tests {
    use super::{parse_args, CliOptions};

    #[test]
    fn ephemeral_flag_is_the_only_option() {
        assert_eq!(parse_args(Vec::new()), Ok(CliOptions::default()));
        assert_eq!(
            parse_args(vec!["--ephemeral".to_string()]),
            Ok(CliOptions { ephemeral: true })
        );
        assert!(parse_args(vec!["--tui".to_string()]).is_err());
    }
}
