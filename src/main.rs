//! bedrock recovery tool
//!
//! Opens a data directory, lets the store and the coordinator finish whatever was
//! in flight when the last process stopped, reports what is there and exits.

use std::path::PathBuf;

use log::info;

use bedrock::{Config, Node};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    config.coordinator.log_path = config.data_dir.join("commit.log");
                    i += 1;
                }
            }
            "--deadlock-timeout-ms" => {
                if i + 1 < args.len() {
                    config.lock.deadlock_timeout_ms = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--step-timeout-ms" => {
                if i + 1 < args.len() {
                    config.coordinator.step_timeout_ms = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("bedrock - lock manager, 2PC coordinator and shadow-paged store");
                println!();
                println!("Usage: bedrock [OPTIONS]");
                println!();
                println!("Opens DIR, recovers in-flight transactions and prints a summary.");
                println!();
                println!("Options:");
                println!("  -d, --data-dir DIR           Data directory (default: ./data)");
                println!("      --deadlock-timeout-ms N  Lock wait limit (default: 10000)");
                println!("      --step-timeout-ms N      Per-phase commit timeout (default: 5000)");
                println!("  -h, --help                   Show this help");
                return Ok(());
            }
            other => {
                eprintln!("Unknown option '{}', see --help", other);
            }
        }
        i += 1;
    }

    info!("Opening {:?}", config.data_dir);
    let node = Node::open(config).await?;

    let db = node.resources().database();
    for table in db.tables() {
        let meta = db.table_geometry(&table)?;
        info!(
            "Table '{}': generation {}, {} pages x {} rows of {} bytes",
            table, meta.version, meta.page_count, meta.rows_per_page, meta.row_size
        );
    }
    for txn in db.transactions() {
        info!("Still prepared: {} ({} pending entries)", txn, db.pending(txn));
    }
    for (txn, state) in node.coordinator().active() {
        info!("Still active in commit log: {} ({})", txn, state);
    }

    Ok(())
}
