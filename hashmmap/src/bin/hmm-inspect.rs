use std::path::PathBuf;
use std::process;

use clap::Parser;
use hashmmap::{LanePoll, RecordHandle, Store, StoreOptions};
use tracing_subscriber::EnvFilter;

/// Print the header, entries and recent changes of a store directory.
#[derive(Parser, Debug)]
#[command(version)]
struct InspectCommand {
    /// The store directory. It must already hold a store.
    dir: PathBuf,
    /// Header size the store was created with.
    #[arg(long, default_value_t = 4096)]
    header_size: usize,
    /// Memory lane size the store was created with.
    #[arg(long, default_value_t = 4096)]
    lane_size: usize,
    /// Print every live entry.
    #[arg(long)]
    entries: bool,
    /// Print the memory lane from this position on.
    #[arg(long)]
    since: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cmd = InspectCommand::parse();

    let missing: Vec<_> = Store::section_paths(&cmd.dir)
        .into_iter()
        .filter(|path| !path.is_file())
        .collect();

    if !missing.is_empty() {
        eprintln!("Not a store, missing {missing:?}");
        process::exit(2);
    }

    let options = StoreOptions {
        header_size: cmd.header_size,
        lane_size: cmd.lane_size,
        ..StoreOptions::default()
    };

    if let Err(err) = inspect(&cmd, &options) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn inspect(cmd: &InspectCommand, options: &StoreOptions) -> hashmmap::Result<()> {
    let mut store = Store::create(Some(cmd.dir.as_path()), options)?;
    let header = store.header()?;
    println!("{header:#?}");

    if cmd.entries {
        for slot in 0..header.slot_end {
            let Some(record) = store.get(RecordHandle::new(slot))? else {
                continue;
            };

            println!(
                "{slot:>8} {:?} = {:?} (updated {}, read {}, counter {})",
                String::from_utf8_lossy(&record.key),
                String::from_utf8_lossy(&record.value),
                record.update_time,
                record.reference_time,
                record.counter,
            );
        }
    }

    if let Some(since) = cmd.since {
        match store.changes_since(since)? {
            LanePoll::Changes { changes, next } => {
                for change in changes {
                    println!(
                        "{:>8} {:?} slot {} counter {} at {}",
                        change.position, change.kind, change.slot, change.counter, change.time
                    );
                }
                println!("next {next}");
            }
            LanePoll::Gap { missed, resume } => {
                println!("missed {missed} changes, oldest available is {resume}");
            }
        }
    }

    Ok(())
}
