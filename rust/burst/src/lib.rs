//! burst-load is a synchronized burst benchmark for document stores.
//!
//! A single coordinator resets a test collection, spawns N workers, and waits for every worker to
//! announce that it is ready.  Only then does it publish a single go signal on a fanout exchange.
//! Each worker hammers the store with writes (or reads) of its own key for a fixed burst duration
//! and returns one timestamp per completed operation.  The coordinator buckets those timestamps
//! into one-second intervals relative to the instant the go signal was published.
//!
//! The two-phase barrier exists to keep cold-start variance out of the measurement window:  a
//! worker that takes ten seconds to connect does not skew the throughput of the first second.
//!
//! The moving pieces are behind traits so the harness can run against anything:
//! - [store::DocumentStore] for the database under test ([couchdb::CouchDb], [store::MemoryStore]).
//! - [broker::Broker] for the ready/go signalling ([broker::LocalBroker]).
//! - [executor::Executor] for running workers ([executor::TokioExecutor]).

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::Counter;

pub mod aggregate;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod couchdb;
pub mod executor;
pub mod opentelemetry_config;
pub mod report;
pub mod store;
pub mod worker;

pub use aggregate::{aggregate, AggregatedSeries};
pub use coordinator::{BurstReport, Coordinator};

use config::{BurstServiceConfig, RootConfig, StoreConfig};
use report::Outputs;
use store::DocumentStore;

const CONFIG_PATH_ENV_VAR: &str = "CONFIG_PATH";

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// A coarse classification of errors, used when logging why a run was discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    InvalidArgument,
    Unavailable,
    DeadlineExceeded,
    NotFound,
    Aborted,
    Internal,
}

/// Errors that invalidate a benchmark run.  There is no partial-success path:  every one of these
/// is fatal to the run that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),
    #[error("only {ready} of {expected} workers became ready within {timeout:?}")]
    ReadyTimeout {
        ready: usize,
        expected: usize,
        timeout: Duration,
    },
    #[error("worker {0} did not receive the go signal within {1:?}")]
    GoTimeout(WorkerId, Duration),
    #[error("worker {worker} could not read back document {key}")]
    DocumentMissing { worker: WorkerId, key: String },
    #[error("worker {worker} failed: {source}")]
    WorkerFailed {
        worker: WorkerId,
        #[source]
        source: Box<Error>,
    },
    #[error("worker task {0} did not run to completion: {1}")]
    Join(WorkerId, String),
    #[error("could not write output: {0}")]
    Output(String),
    #[error("interrupted before the run finished")]
    Interrupted,
}

impl Error {
    /// The classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidConfig(_) => ErrorCode::InvalidArgument,
            Error::Store(err) => err.code(),
            Error::Broker(_) => ErrorCode::Unavailable,
            Error::ReadyTimeout { .. } => ErrorCode::DeadlineExceeded,
            Error::GoTimeout(..) => ErrorCode::DeadlineExceeded,
            Error::DocumentMissing { .. } => ErrorCode::NotFound,
            Error::WorkerFailed { source, .. } => source.code(),
            Error::Join(..) => ErrorCode::Aborted,
            Error::Output(_) => ErrorCode::Internal,
            Error::Interrupted => ErrorCode::Aborted,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Output(err.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Output(err.to_string())
    }
}

///////////////////////////////////////////// WorkerId /////////////////////////////////////////////

/// The identity of a worker.  Worker ids are dense, starting at zero, and double as the key of the
/// document the worker owns.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// The document key this worker reads and writes.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/////////////////////////////////////////////// Mode ///////////////////////////////////////////////

/// Whether workers write or read during the burst.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "write")]
    Write,
    #[serde(rename = "read")]
    Read,
}

impl Mode {
    /// "write" or "read".
    pub fn verb(&self) -> &'static str {
        match self {
            Mode::Write => "write",
            Mode::Read => "read",
        }
    }

    /// "writers" or "readers".
    pub fn actors(&self) -> &'static str {
        match self {
            Mode::Write => "writers",
            Mode::Read => "readers",
        }
    }

    /// "writes" or "reads".
    pub fn actions(&self) -> &'static str {
        match self {
            Mode::Write => "writes",
            Mode::Read => "reads",
        }
    }
}

//////////////////////////////////////////// BurstConfig ///////////////////////////////////////////

/// The parameters of one benchmark run.  Immutable once constructed; [BurstConfig::new] is the
/// only way to build one, so every instance has at least one worker and a non-zero burst.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
pub struct BurstConfig {
    worker_count: usize,
    burst_duration_seconds: u64,
    payload_size_bytes: usize,
    mode: Mode,
}

impl BurstConfig {
    pub fn new(
        worker_count: usize,
        burst_duration_seconds: u64,
        payload_size_bytes: usize,
        mode: Mode,
    ) -> Result<Self, Error> {
        if worker_count == 0 {
            return Err(Error::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if burst_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "burst duration must be at least 1 second".to_string(),
            ));
        }
        Ok(Self {
            worker_count,
            burst_duration_seconds,
            payload_size_bytes,
            mode,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn burst_duration_seconds(&self) -> u64 {
        self.burst_duration_seconds
    }

    pub fn burst_duration(&self) -> Duration {
        Duration::from_secs(self.burst_duration_seconds)
    }

    pub fn payload_size_bytes(&self) -> usize {
        self.payload_size_bytes
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The stem shared by every output file of this run, e.g. `couchdb_4writers_5sec_10bytes`.
    pub fn file_stem(&self) -> String {
        format!(
            "couchdb_{}{}_{}sec_{}bytes",
            self.worker_count,
            self.mode.actors(),
            self.burst_duration_seconds,
            self.payload_size_bytes
        )
    }
}

///////////////////////////////////////////// Timestamp ////////////////////////////////////////////

/// Wall-clock seconds since the Unix epoch.
pub type Timestamp = f64;

/// The ordered timestamps of every operation one worker completed during its burst.
pub type TimestampTrace = Vec<Timestamp>;

/// The current wall-clock time as a [Timestamp].
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

////////////////////////////////////////////// Metrics /////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct Metrics {
    /// The number of ready signals counted by the barrier.
    ready: Counter<u64>,
    /// The number of go signals published.
    go: Counter<u64>,
    /// The number of writes completed during bursts.
    writes: Counter<u64>,
    /// The number of reads completed during bursts.
    reads: Counter<u64>,
    /// The number of workers that failed.
    worker_failures: Counter<u64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter = global::meter("burst_load");
        Metrics {
            ready: meter.u64_counter("ready").build(),
            go: meter.u64_counter("go").build(),
            writes: meter.u64_counter("writes").build(),
            reads: meter.u64_counter("reads").build(),
            worker_failures: meter.u64_counter("worker_failures").build(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

//////////////////////////////////////////// entrypoint ////////////////////////////////////////////

/// Load the config from `path`, else from the file named by `CONFIG_PATH`, else from the default
/// path.
pub fn load_config(path: Option<&str>) -> Result<BurstServiceConfig, Error> {
    let config = match path
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_PATH_ENV_VAR).ok())
    {
        Some(config_path) => RootConfig::load_from_path(&config_path),
        None => RootConfig::load(),
    };
    config
        .map(|c| c.burst_load)
        .map_err(|err| Error::InvalidConfig(err.to_string()))
}

/// Connect to the configured store.
pub fn open_store(store: &StoreConfig) -> Result<Arc<dyn DocumentStore>, Error> {
    let store: Arc<dyn DocumentStore> = match store {
        StoreConfig::CouchDb { url } => Arc::new(couchdb::CouchDb::new(url)?),
        StoreConfig::Memory => Arc::new(store::MemoryStore::new()),
    };
    Ok(store)
}

/// Run one burst end to end:  run it, log it, and write its CSVs and plots.
pub async fn entrypoint(
    config: BurstConfig,
    service: BurstServiceConfig,
) -> Result<(BurstReport, Outputs), Error> {
    let metrics = Metrics::new();
    let store = open_store(&service.store)?;
    let coordinator = Coordinator::new(
        config,
        service.clone(),
        store,
        Arc::new(broker::LocalBroker::new()),
        Arc::new(executor::TokioExecutor::new(metrics.clone())),
        metrics,
    );
    let report = coordinator.run().await?;
    report::log_summary(&report.config, &report.series);
    let outputs = report::render(
        &report.config,
        &report.series,
        &service.csv_dir,
        &service.plots_dir,
    )?;
    tracing::info!(
        average_csv = %outputs.average_csv.display(),
        sum_csv = %outputs.sum_csv.display(),
        average_plot = %outputs.average_plot.display(),
        sum_plot = %outputs.sum_plot.display(),
        "wrote results"
    );
    Ok((report, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_config_rejects_zero_workers() {
        assert!(matches!(
            BurstConfig::new(0, 5, 10, Mode::Write),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn burst_config_rejects_zero_duration() {
        assert!(matches!(
            BurstConfig::new(1, 0, 10, Mode::Read),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn file_stem() {
        let config = BurstConfig::new(4, 5, 10, Mode::Write).unwrap();
        assert_eq!("couchdb_4writers_5sec_10bytes", config.file_stem());
        let config = BurstConfig::new(1, 3, 0, Mode::Read).unwrap();
        assert_eq!("couchdb_1readers_3sec_0bytes", config.file_stem());
    }

    #[test]
    fn worker_failure_keeps_inner_code() {
        let err = Error::WorkerFailed {
            worker: WorkerId(3),
            source: Box::new(Error::DocumentMissing {
                worker: WorkerId(3),
                key: "3".to_string(),
            }),
        };
        assert_eq!(ErrorCode::NotFound, err.code());
    }

    #[test]
    fn open_memory_store() {
        assert!(open_store(&StoreConfig::Memory).is_ok());
        assert!(open_store(&StoreConfig::CouchDb {
            url: "not a url".to_string()
        })
        .is_err());
    }
}
