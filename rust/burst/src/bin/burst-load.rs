//! Run one synchronized burst against the configured document store.

use std::process::ExitCode;

use clap::Parser;

use burst_load::opentelemetry_config::init_otel_tracing;
use burst_load::{entrypoint, load_config, BurstConfig, Mode};

#[derive(Parser, Debug)]
#[command(about = "Burst benchmark for document stores")]
struct Args {
    /// Number of workers.
    #[arg(short = 'n', default_value_t = 1)]
    workers: usize,
    /// Burst duration in seconds.
    #[arg(short = 't', default_value_t = 5)]
    seconds: u64,
    /// Payload size in bytes.
    #[arg(short = 's', default_value_t = 10)]
    size: usize,
    /// Workers write during the burst.  The default.
    #[arg(long, conflicts_with = "read")]
    write: bool,
    /// Workers read during the burst.
    #[arg(long)]
    read: bool,
    /// Config file; overrides CONFIG_PATH.
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.read {
            Mode::Read
        } else {
            Mode::Write
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let service = match load_config(args.config.as_deref()) {
        Ok(service) => service,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let config = match BurstConfig::new(args.workers, args.seconds, args.size, args.mode()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = init_otel_tracing(&service.service_name, service.otel_endpoint.as_deref());
    match entrypoint(config, service).await {
        Ok((report, _)) => {
            println!(
                "{} {}: {}",
                report.config.mode().actions(),
                report.config.file_stem(),
                report.series.total()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(code = ?err.code(), "run failed: {err}");
            ExitCode::FAILURE
        }
    }
}
