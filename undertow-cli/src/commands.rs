//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use undertow_core::format::{format_bytes, format_bytes_per_second, format_eta};
use undertow_core::session::{FilePriority, SessionManager, TransferRecord};
use undertow_core::torrent::{DiscoveredTorrent, InfoHash};
use undertow_core::{Result, SimulatedEngine, UndertowConfig, UndertowError};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Add a transfer from a magnet link or .torrent file
    Add {
        /// Magnet link or path to a torrent file
        source: String,
        /// Display name to use until metadata arrives
        #[arg(short, long)]
        name: Option<String>,
        /// Only download these file indices (comma separated)
        #[arg(long, value_delimiter = ',')]
        select: Option<Vec<usize>>,
        /// Wait this many seconds for the file list before returning
        #[arg(long)]
        wait: Option<u64>,
    },
    /// List transfers
    List,
    /// Show the files of a transfer
    Files {
        /// Transfer id or unique id prefix
        transfer: String,
    },
    /// Pause a transfer
    Pause {
        /// Transfer id or unique id prefix
        transfer: String,
    },
    /// Resume a paused, stopped or failed transfer
    Resume {
        /// Transfer id or unique id prefix
        transfer: String,
    },
    /// Stop a transfer until it is resumed explicitly
    Stop {
        /// Transfer id or unique id prefix
        transfer: String,
    },
    /// Remove a transfer
    Remove {
        /// Transfer id or unique id prefix
        transfer: String,
        /// Also delete downloaded data
        #[arg(long)]
        delete_files: bool,
    },
    /// Change the priority of one file
    Priority {
        /// Transfer id or unique id prefix
        transfer: String,
        /// File index as shown by `files`
        index: usize,
        /// New priority
        #[arg(value_enum)]
        level: FilePriority,
    },
    /// Run the session and print progress
    Watch {
        /// Seconds to run before shutting down
        #[arg(short, long, default_value = "30")]
        seconds: u64,
    },
    /// Remove every completed transfer, keeping its data
    ClearCompleted,
}

/// Opens the session, runs one command and shuts the session down.
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(config: UndertowConfig, command: Commands) -> Result<()> {
    let engine = Arc::new(SimulatedEngine::new(config.simulation.clone()));
    let session = SessionManager::open(config, engine.clone()).await?;

    let result = match command {
        Commands::Add {
            source,
            name,
            select,
            wait,
        } => add_transfer(&session, &engine, source, name, select, wait).await,
        Commands::List => {
            list_transfers(&session).await;
            Ok(())
        }
        Commands::Files { transfer } => show_files(&session, &transfer).await,
        Commands::Pause { transfer } => {
            let id = resolve_transfer(&session, &transfer).await?;
            report(id, "paused", session.pause(id).await?);
            Ok(())
        }
        Commands::Resume { transfer } => {
            let id = resolve_transfer(&session, &transfer).await?;
            report(id, "resumed", session.resume(id).await?);
            Ok(())
        }
        Commands::Stop { transfer } => {
            let id = resolve_transfer(&session, &transfer).await?;
            report(id, "stopped", session.stop(id).await?);
            Ok(())
        }
        Commands::Remove {
            transfer,
            delete_files,
        } => {
            let id = resolve_transfer(&session, &transfer).await?;
            session.remove(id, delete_files).await?;
            println!("Removed {}", id.short());
            Ok(())
        }
        Commands::Priority {
            transfer,
            index,
            level,
        } => {
            let id = resolve_transfer(&session, &transfer).await?;
            session.set_file_priority(id, index, level).await?;
            println!("File {index} of {} set to {level}", id.short());
            Ok(())
        }
        Commands::Watch { seconds } => watch(&session, &engine, seconds).await,
        Commands::ClearCompleted => {
            let removed = session.remove_completed().await?;
            println!("Removed {} completed transfer(s)", removed.len());
            Ok(())
        }
    };

    session.shutdown().await;
    result
}

async fn add_transfer(
    session: &SessionManager,
    engine: &Arc<SimulatedEngine>,
    source: String,
    name: Option<String>,
    select: Option<Vec<usize>>,
    wait: Option<u64>,
) -> Result<()> {
    let discovered = DiscoveredTorrent::new(name.unwrap_or_default(), source);
    let outcome = session.add_transfer(discovered, select).await?;
    let record = outcome.record();

    if outcome.is_new() {
        println!("Added {} ({})", record.id, record.display_name);
    } else {
        println!("Already tracking {} ({})", record.id, record.display_name);
    }

    if let Some(seconds) = wait {
        let clock = engine.start_clock();
        let files = session
            .wait_for_metadata(record.id, Some(Duration::from_secs(seconds)))
            .await;
        clock.abort();
        let files = files?;
        // Applies a pending --select now that the file list is known.
        session.reconcile_now().await;
        print_files(&files);
    }

    Ok(())
}

async fn list_transfers(session: &SessionManager) {
    let transfers = session.list_transfers().await;
    if transfers.is_empty() {
        println!("No transfers yet.");
        println!("Use 'undertow add <magnet-link-or-file>' to add one.");
        return;
    }

    println!(
        "{:<10} {:<12} {:>7} {:>10} {:>12} {:>9}  NAME",
        "ID", "STATE", "DONE", "SIZE", "DOWN", "ETA"
    );
    for record in &transfers {
        print_transfer(record);
    }
}

async fn show_files(session: &SessionManager, transfer: &str) -> Result<()> {
    let id = resolve_transfer(session, transfer).await?;
    let files = session.files(id).await?;
    if files.is_empty() {
        println!("File list of {} is not known yet", id.short());
    } else {
        print_files(&files);
    }
    Ok(())
}

async fn watch(session: &SessionManager, engine: &Arc<SimulatedEngine>, seconds: u64) -> Result<()> {
    let clock = engine.start_clock();
    let listener = session.register_listener(|records| {
        println!("{:-<72}", "");
        for record in records {
            print_transfer(record);
        }
    });
    session.start();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }

    session.unregister_listener(listener);
    clock.abort();
    Ok(())
}

fn print_transfer(record: &TransferRecord) {
    let size = if record.total_bytes > 0 {
        format_bytes(record.total_bytes)
    } else {
        record.size_hint.clone().unwrap_or_else(|| "?".to_string())
    };
    println!(
        "{:<10} {:<12} {:>6.1}% {:>10} {:>12} {:>9}  {}",
        record.id.short(),
        record.state.label(),
        record.progress * 100.0,
        size,
        format_bytes_per_second(record.download_rate),
        format_eta(record.eta_seconds),
        record.display_name
    );
    if let Some(error) = &record.last_error {
        println!("{:<10} error: {}", "", error);
    }
}

fn print_files(files: &[undertow_core::FileEntry]) {
    for file in files {
        println!(
            "{:>4}  {:<6} {:>6.1}% {:>10}  {}",
            file.index,
            file.priority,
            file.progress() * 100.0,
            format_bytes(file.size_bytes),
            file.relative_path
        );
    }
}

fn report(id: InfoHash, action: &str, changed: bool) {
    if changed {
        println!("{} {}", capitalize(action), id.short());
    } else {
        println!("{} was not {}: nothing to do", id.short(), action);
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Resolves a full id or a unique prefix of a visible transfer's id.
async fn resolve_transfer(session: &SessionManager, transfer: &str) -> Result<InfoHash> {
    if let Ok(id) = transfer.parse::<InfoHash>() {
        return Ok(id);
    }

    let prefix = transfer.to_ascii_lowercase();
    let matches: Vec<InfoHash> = session
        .list_transfers()
        .await
        .into_iter()
        .map(|record| record.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(UndertowError::Configuration {
            reason: format!("No transfer matches '{transfer}'"),
        }),
        _ => Err(UndertowError::Configuration {
            reason: format!("'{transfer}' matches {} transfers", matches.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("paused"), "Paused");
        assert_eq!(capitalize(""), "");
    }
}
