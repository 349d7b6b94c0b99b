use std::{env, process};

use serde_json::json;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vfsattrs::{
    AnyPagedStorage, AttributesStorage, BackendKind, StorageConfig, StorageError, StorageResult, cli::CommandLineConfig,
    open_attributes_storage,
};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", CommandLineConfig::help());
        return;
    }
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let config = match CommandLineConfig::from_args(&arg_refs) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(2);
        }
    };

    init_logging();

    let attributes = match open_storage(&config) {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("{err}");
            process::exit(2);
        }
    };

    let result = run_command(&attributes, &config.command, &config.command_args);
    let closed = attributes.close();
    if let Err(err) = result.and(closed) {
        eprintln!("command failed: {err}");
        process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("VFSATTRS_LOG").unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_storage(config: &CommandLineConfig) -> Result<AttributesStorage<AnyPagedStorage>, String> {
    let database = config
        .database
        .as_deref()
        .ok_or_else(|| "--db PATH is required".to_string())?;

    let mut storage_config = match &config.config_path {
        Some(path) => StorageConfig::from_json_file(path).map_err(|e| format!("{path}: {e}"))?,
        None => StorageConfig::default(),
    };
    if let Some(backend) = &config.backend {
        storage_config.backend = BackendKind::parse(backend).map_err(|e| e.to_string())?;
    }

    open_attributes_storage(database, &storage_config).map_err(|e| format!("{database}: {e}"))
}

fn run_command(
    attributes: &AttributesStorage<AnyPagedStorage>,
    command: &str,
    args: &[String],
) -> StorageResult<()> {
    match command {
        "stats" => {
            let stats = attributes.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        "dump" => {
            attributes.for_each_attribute(|visit| {
                let payload = json!({
                    "record_id": visit.record_id,
                    "file_id": visit.file_id,
                    "attribute_id": visit.attribute_id,
                    "len": visit.value.len(),
                    "inlined": visit.inlined,
                    "value": String::from_utf8_lossy(&visit.value),
                });
                println!("{payload}");
            })?;
            Ok(())
        }
        "check" => {
            let report = attributes.check_sanity()?;
            let payload = json!({
                "command": "check",
                "ok": true,
                "directories": report.directories,
                "inline_attributes": report.inline_attributes,
                "dedicated_attributes": report.dedicated_attributes,
            });
            println!("{payload}");
            Ok(())
        }
        "put" => {
            let (file_id, attribute_id) = parse_key(args)?;
            let value = args
                .get(2)
                .ok_or_else(|| StorageError::invalid_config("put requires FILE_ID ATTR_ID VALUE"))?;
            let handle = attributes.insert_or_update_record(file_id, attribute_id, value.as_bytes())?;
            println!(
                "{}",
                json!({
                    "command": "put",
                    "file_id": file_id,
                    "attribute_id": attribute_id,
                    "directory_record": handle.directory_record,
                    "len": value.len(),
                })
            );
            Ok(())
        }
        "get" => {
            let (file_id, attribute_id) = parse_key(args)?;
            let value = attributes.read_value_from_storage(file_id, attribute_id)?;
            println!("{}", String::from_utf8_lossy(&value));
            Ok(())
        }
        "delete" => {
            let (file_id, attribute_id) = parse_key(args)?;
            attributes.delete_record(file_id, attribute_id)?;
            println!("deleted file_id={file_id} attribute_id={attribute_id}");
            Ok(())
        }
        "delete-file" => {
            let file_id = parse_number(args.first(), "FILE_ID")?;
            let deleted = attributes.delete_attributes(file_id)?;
            println!("deleted_file file_id={file_id} had_attributes={deleted}");
            Ok(())
        }
        other => Err(StorageError::invalid_config(format!(
            "unknown command {other} (see --help)"
        ))),
    }
}

fn parse_key(args: &[String]) -> StorageResult<(u32, u32)> {
    Ok((
        parse_number(args.first(), "FILE_ID")?,
        parse_number(args.get(1), "ATTR_ID")?,
    ))
}

fn parse_number(arg: Option<&String>, name: &str) -> StorageResult<u32> {
    let arg = arg.ok_or_else(|| StorageError::invalid_config(format!("missing {name}")))?;
    arg.parse()
        .map_err(|_| StorageError::invalid_config(format!("{name} must be a non-negative integer, got {arg}")))
}
