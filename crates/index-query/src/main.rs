//! Operator CLI over a volume catalog data directory.
//!
//! Usage:
//!   index-query <data-dir> add <path>
//!   index-query <data-dir> sync <volume-id> [new-path]
//!   index-query <data-dir> volumes
//!   index-query <data-dir> search <query> [limit]
//!   index-query <data-dir> children <volume-id> <path> [limit] [offset]
//!   index-query <data-dir> status [volume-id]
//!   index-query <data-dir> recover <restore|continue|details>
//!
//! Results go to stdout as JSON, logs to stderr. Set RUST_LOG to change the log level.

use std::env;
use std::path::Path;
use std::process::ExitCode;

use serde_json::Value;
use volume_catalog::indexing::{RecoveryChoice, ScanJob};
use volume_catalog::{CatalogError, CatalogService};

const DEFAULT_LIMIT: u32 = 50;

fn usage() -> ExitCode {
    eprintln!(
        "usage: index-query <data-dir> <add <path> | sync <volume-id> [new-path] | volumes | search <query> [limit] | \
         children <volume-id> <path> [limit] [offset] | status [volume-id] | recover <restore|continue|details>>"
    );
    ExitCode::from(2)
}

fn parse_number(arg: Option<&String>, default: u32) -> Option<u32> {
    match arg {
        Some(s) => s.parse().ok(),
        None => Some(default),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, CatalogError> {
    serde_json::to_value(value).map_err(|e| CatalogError::Io(std::io::Error::other(e)))
}

fn wait(job: ScanJob) -> Result<Value, CatalogError> {
    log::info!("Scanning volume {}", job.volume_id());
    to_json(&job.join()?)
}

fn run(service: &CatalogService, command: &str, args: &[String]) -> Option<Result<Value, CatalogError>> {
    let result = match (command, args) {
        ("add", [path]) => service.add_volume(Path::new(path)).and_then(wait),
        ("sync", [id]) => service.sync_volume(id, None).and_then(wait),
        ("sync", [id, path]) => service.sync_volume(id, Some(Path::new(path))).and_then(wait),
        ("volumes", []) => service.list_volumes(false).and_then(|v| to_json(&v)),
        ("search", [query, rest @ ..]) if rest.len() <= 1 => {
            let limit = parse_number(rest.first(), DEFAULT_LIMIT)?;
            service.search(query, limit).and_then(|hits| to_json(&hits))
        }
        ("children", [id, path, rest @ ..]) if rest.len() <= 2 => {
            let limit = parse_number(rest.first(), DEFAULT_LIMIT)?;
            let offset = parse_number(rest.get(1), 0)?;
            service
                .list_children(id, path, limit, offset)
                .and_then(|entries| to_json(&entries))
        }
        ("status", []) => to_json(&service.scan_status(None)),
        ("status", [id]) => service.index_status(id).and_then(|s| to_json(&s)),
        ("recover", [choice]) => {
            let choice = match choice.as_str() {
                "restore" => RecoveryChoice::RestoreFromBackup,
                "continue" => RecoveryChoice::ContinueAnyway,
                "details" => RecoveryChoice::ShowDetails,
                _ => return None,
            };
            service.resolve_interrupted_sync(choice).and_then(|r| to_json(&r))
        }
        _ => return None,
    };
    Some(result)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [data_dir, command, rest @ ..] = args.as_slice() else {
        return usage();
    };

    let service = match CatalogService::open(Path::new(data_dir)) {
        Ok(service) => service,
        Err(e) => {
            log::error!("Could not open catalog at {data_dir}: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(pending) = service.check_interrupted_sync()
        && command != "recover"
    {
        log::warn!(
            "An interrupted {} of {} is pending; run `recover details` to inspect it",
            pending.operation,
            pending.volume_name
        );
    }

    match run(&service, command, rest) {
        None => usage(),
        Some(Ok(value)) => {
            match serde_json::to_string_pretty(&value) {
                Ok(text) => println!("{text}"),
                Err(e) => log::error!("Could not format result: {e}"),
            }
            ExitCode::SUCCESS
        }
        Some(Err(e)) => {
            log::error!("{command} failed: {e}");
            ExitCode::FAILURE
        }
    }
}
