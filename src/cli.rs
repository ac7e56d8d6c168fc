use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sentry-agent", version, about = "Host monitoring agent")]
pub struct Cli {
    #[command(flatten)]
    pub shared: SharedArgs,
    #[command(flatten)]
    pub logging: LoggingArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct SharedArgs {
    /// Path to the persisted agent configuration document.
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,
    /// Base URL of the collector's web API.
    #[arg(long, global = true)]
    pub webapi_url: Option<String>,
    /// Agent identifier; defaults to a hash of the hostname.
    #[arg(long, global = true)]
    pub id: Option<String>,
    /// Path to the local spool database file.
    #[arg(long, global = true)]
    pub dbpath: Option<PathBuf>,
    /// Directory holding TLS key/CSR/cert/CA material.
    #[arg(long, global = true)]
    pub certs_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct LoggingArgs {
    #[arg(long, short = 'l', value_enum, default_value_t = LogLevel::Error, global = true)]
    pub level: LogLevel,
    #[arg(long, short = 'v', global = true, default_value_t = false)]
    pub verbose: bool,
    #[arg(long, short = 'd', global = true, default_value_t = false)]
    pub debug: bool,
}

impl LoggingArgs {
    pub fn effective_level(&self) -> LogLevel {
        if self.debug {
            LogLevel::Debug
        } else if self.verbose {
            LogLevel::Info
        } else {
            self.level
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full agent: supervisor, receiver, shipper, all workers.
    Run,
    /// Fetch and persist the remote configuration document, then exit.
    GetConfig,
    /// Check connectivity to the collector and exit.
    CheckConnection,
    /// Generate a key/CSR (if missing) and submit the CSR for signing.
    RequestCertificateSign,
    /// Poll once for a signed certificate.
    FetchCertificate,
    /// Generate the agent's key and CSR without contacting the collector.
    Initialize,
    /// Run a single sensor kind standalone with an inline config, printing
    /// produced results to stdout.
    TestSensors(TestSensorsArgs),
    /// Internal: hosts one sensor instance in an isolated process. Not part
    /// of the documented CLI surface; invoked only by the agent itself.
    #[command(hide = true)]
    SensorRun(SensorRunArgs),
}

#[derive(Args)]
pub struct TestSensorsArgs {
    pub sensor_name: String,
    /// Inline JSON config for the sensor under test.
    pub config_json: String,
}

#[derive(Args)]
pub struct SensorRunArgs {
    #[arg(long)]
    pub kind: String,
    #[arg(long)]
    pub config_id: String,
    #[arg(long)]
    pub target: String,
    #[arg(long)]
    pub target_id: String,
    #[arg(long)]
    pub config_json: String,
    #[arg(long)]
    pub db_path: PathBuf,
}
