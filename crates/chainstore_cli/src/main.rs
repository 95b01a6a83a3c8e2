//! CLI smoke and inspection entry point.
//!
//! # Responsibility
//! - Verify `chainstore_core` linkage.
//! - Open (and migrate) a database file and print per-type chain statistics.
//!
//! Usage: `chainstore_cli [DB_PATH]`. Set `CHAINSTORE_LOG_DIR` to an absolute
//! directory to write logs there.

use chainstore_core::{core_version, default_log_level, init_logging, open_db, LoggingConfig};
use chainstore_core::SqliteEntityStore;
use log::error;
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("chainstore_core version={}", core_version());

    if let Ok(dir) = std::env::var("CHAINSTORE_LOG_DIR") {
        let config = LoggingConfig {
            level: default_log_level().to_string(),
            dir,
        };
        if let Err(err) = init_logging(&config) {
            eprintln!("logging disabled: {err}");
        }
    }

    let Some(path) = std::env::args().nth(1) else {
        return ExitCode::SUCCESS;
    };
    match print_summary(&path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_inspect module=cli status=error path={path} error={err}");
            eprintln!("failed to inspect `{path}`: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_summary(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let conn = open_db(path)?;
    let store = SqliteEntityStore::try_new(&conn)?;
    let summary = store.type_summary()?;
    if summary.is_empty() {
        println!("no entities");
    }
    for (entity_type, heads, versions, published) in summary {
        println!("{entity_type} heads={heads} versions={versions} published={published}");
    }
    Ok(())
}
