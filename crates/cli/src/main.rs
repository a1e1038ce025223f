//! clamwire CLI - probe and scan through a clamd daemon.

mod cli;

use std::path::PathBuf;
use std::process::ExitCode;

use clamwire_client::{ClamdService, ClientFactory, ScanResult};
use clap::Parser;
use eyre::WrapErr;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit status for failures other than a detection.
const EXIT_ERROR: u8 = 2;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("CLAMWIRE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = cli::Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "command failed");
            eprintln!("clamwire: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(cli: &cli::Cli) -> eyre::Result<ExitCode> {
    let config = cli.resolve_config()?;
    debug!(?config, host = %cli.host, port = cli.port, "resolved config");

    let factory = ClientFactory::new(config);
    let service = factory.create_service(cli.host.clone(), cli.port)?;

    let code = match &cli.command {
        cli::Command::Ping => {
            service.ping().wrap_err("ping failed")?;
            print_value(cli.json, &serde_json::json!({ "pong": true }), "PONG");
            ExitCode::SUCCESS
        }
        cli::Command::Version => {
            let version = service.version()?;
            print_value(cli.json, &serde_json::json!(version), &version.raw);
            ExitCode::SUCCESS
        }
        cli::Command::Commands => {
            let (version, commands) = service.commands()?;
            let text = format!("{}\n{}", version.raw, commands.join("\n"));
            let value = serde_json::json!({ "version": version, "commands": commands });
            print_value(cli.json, &value, &text);
            ExitCode::SUCCESS
        }
        cli::Command::Stats => {
            let stats = service.stats()?;
            print_value(cli.json, &serde_json::json!({ "stats": stats }), &stats);
            ExitCode::SUCCESS
        }
        cli::Command::Reload => {
            service.reload()?;
            print_value(cli.json, &serde_json::json!({ "reloading": true }), "RELOADING");
            ExitCode::SUCCESS
        }
        cli::Command::Scan { files } => run_scan(&service, files, cli.json)?,
    };

    factory.shutdown();
    Ok(code)
}

fn run_scan(service: &ClamdService, files: &[PathBuf], json: bool) -> eyre::Result<ExitCode> {
    if files.is_empty() {
        debug!("scanning stdin");
        let result = service.scan_reader(std::io::stdin()).wrap_err("scan of stdin failed")?;
        report("stream", &result, json);
        return Ok(exit_for(std::iter::once(&result)));
    }

    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let result = service
            .scan_file(path)
            .wrap_err_with(|| format!("scan of {} failed", path.display()))?;
        report(&path.display().to_string(), &result, json);
        results.push(result);
    }
    let found = results.iter().filter(|r| !r.is_ok()).count();
    info!(scanned = results.len(), found, "scan complete");
    Ok(exit_for(results.iter()))
}

fn exit_for<'a>(mut results: impl Iterator<Item = &'a ScanResult>) -> ExitCode {
    if results.all(ScanResult::is_ok) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn report(name: &str, result: &ScanResult, json: bool) {
    let text = match result.signature() {
        None => format!("{name}: OK"),
        Some(signature) => format!("{name}: {signature} FOUND"),
    };
    let value = serde_json::json!({ "name": name, "result": result });
    print_value(json, &value, &text);
}

fn print_value(json: bool, value: &serde_json::Value, text: &str) {
    if json {
        println!("{value}");
    } else {
        println!("{text}");
    }
}
