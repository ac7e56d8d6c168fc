mod cli;
mod config;
mod enroll;
mod error;
mod framing;
mod model;
mod receiver;
mod registry;
mod sensor_run;
mod sensor_storage;
mod shipper;
mod spool;
mod supervisor;
mod transport;
mod worker;

use crate::cli::{Cli, Commands};
use crate::config::Settings;
use crate::enroll::{CertPaths, FetchOutcome};
use crate::model::DataPoint;
use crate::transport::Transport;
use anyhow::{Context, Result};
use clap::Parser;

fn init_tracing(level: &str, to_stderr: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{level},sentry_agent={level}").into());
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true);
    let result = if to_stderr {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow::anyhow!(err.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.logging.effective_level().as_filter();

    // The hidden sensor-run subcommand is hosted in its own process whose
    // stdout is a newline-delimited DataPoint wire; logging must never share
    // that stream, so it goes to stderr instead.
    if let Commands::SensorRun(args) = &cli.command {
        init_tracing(level, true)?;
        let config: serde_json::Value =
            serde_json::from_str(&args.config_json).context("parsing --config-json")?;
        return sensor_run::run(sensor_run::RunArgs {
            sensor_kind: args.kind.clone(),
            config_id: args.config_id.clone(),
            config,
            db_path: args.db_path.clone(),
        })
        .await;
    }

    init_tracing(level, false)?;

    let settings = Settings::resolve(
        cli.shared.config_path,
        cli.shared.webapi_url,
        cli.shared.id,
        cli.shared.dbpath,
        cli.shared.certs_dir,
    )?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::GetConfig => get_config(settings).await,
        Commands::CheckConnection => check_connection(settings).await,
        Commands::RequestCertificateSign => request_certificate_sign(settings).await,
        Commands::FetchCertificate => fetch_certificate(settings).await,
        Commands::Initialize => initialize(settings),
        Commands::TestSensors(args) => test_sensors(settings, args).await,
        Commands::SensorRun(_) => unreachable!("handled above"),
    }
}

/// Ensures the agent has a key/CSR/signed certificate before it talks to the
/// collector over mTLS, running the full initialize -> submit -> poll cycle
/// if needed (spec.md §4.4, §4.8).
async fn ensure_enrolled(transport: &mut Transport, paths: &CertPaths, hostname: &str) -> Result<()> {
    if paths.enrolled() {
        return Ok(());
    }
    if !paths.key.exists() {
        enroll::initialize(paths, hostname)?;
    }
    enroll::submit_csr(transport, paths).await?;

    loop {
        match enroll::poll_certificate(transport, paths).await? {
            FetchOutcome::Signed => {
                transport.refresh_identity()?;
                tracing::info!("enrollment complete, certificate installed");
                return Ok(());
            }
            FetchOutcome::NotYetSigned | FetchOutcome::Revoked => {
                tracing::info!("certificate not yet available, retrying in 10s");
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            }
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let self_exe = std::env::current_exe().context("resolving own executable path")?;
    let spool = spool::spawn_spool_thread(settings.db_path.clone())?;
    let paths = CertPaths::new(&settings.certs_dir);

    let mut enroll_transport = Transport::new(
        settings.webapi_url.clone(),
        settings.agent_id.clone(),
        settings.certs_dir.clone(),
    )?;
    ensure_enrolled(&mut enroll_transport, &paths, &settings.hostname).await?;

    let precheck_transport = Transport::new(
        settings.webapi_url.clone(),
        settings.agent_id.clone(),
        settings.certs_dir.clone(),
    )?;
    supervisor::clock_sync_precheck(&precheck_transport, settings.clock_skew_bound).await?;

    let (results_tx, results_rx) = tokio::sync::mpsc::channel::<DataPoint>(10_000);

    let receiver_handle = tokio::spawn(receiver::run(spool.clone(), results_rx));

    let shipper_transport = Transport::new(
        settings.webapi_url.clone(),
        settings.agent_id.clone(),
        settings.certs_dir.clone(),
    )?;
    let shipper_handle = tokio::spawn(shipper::Shipper::new(spool.clone(), shipper_transport, true).run());

    let supervisor_transport = Transport::new(
        settings.webapi_url.clone(),
        settings.agent_id.clone(),
        settings.certs_dir.clone(),
    )?;
    let mut supervisor = supervisor::Supervisor::new(
        settings.clone(),
        self_exe,
        spool.clone(),
        supervisor_transport,
        results_tx,
    );
    let initial_config = supervisor.load_persisted_config();
    supervisor.apply_remote_config(initial_config).await;

    tracing::info!(agent_id = %settings.agent_id, "sentry-agent running");
    let result = supervisor.run_main_loop().await;

    receiver_handle.abort();
    shipper_handle.abort();
    result
}

async fn get_config(settings: Settings) -> Result<()> {
    let transport = Transport::new(settings.webapi_url, settings.agent_id, settings.certs_dir)?;
    let config = supervisor::fetch_remote_config(&transport).await?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn check_connection(settings: Settings) -> Result<()> {
    let transport = Transport::new(settings.webapi_url, settings.agent_id, settings.certs_dir)?;
    match transport.get("/").await {
        Ok(resp) => {
            println!("reachable, status {}", resp.status);
            Ok(())
        }
        Err(err) => {
            println!("unreachable: {err}");
            Err(err.into())
        }
    }
}

async fn request_certificate_sign(settings: Settings) -> Result<()> {
    let transport = Transport::new(
        settings.webapi_url,
        settings.agent_id.clone(),
        settings.certs_dir.clone(),
    )?;
    let paths = CertPaths::new(&settings.certs_dir);
    if !paths.key.exists() {
        enroll::initialize(&paths, &settings.hostname)?;
    }
    enroll::submit_csr(&transport, &paths).await?;
    println!("CSR submitted");
    Ok(())
}

async fn fetch_certificate(settings: Settings) -> Result<()> {
    let transport = Transport::new(settings.webapi_url, settings.agent_id, settings.certs_dir.clone())?;
    let paths = CertPaths::new(&settings.certs_dir);
    match enroll::poll_certificate(&transport, &paths).await? {
        FetchOutcome::Signed => println!("certificate installed"),
        FetchOutcome::NotYetSigned => println!("not yet signed"),
        FetchOutcome::Revoked => println!("revoked"),
    }
    Ok(())
}

fn initialize(settings: Settings) -> Result<()> {
    let paths = CertPaths::new(&settings.certs_dir);
    enroll::initialize(&paths, &settings.hostname)?;
    println!("key and CSR written to {}", settings.certs_dir.display());
    Ok(())
}

async fn test_sensors(settings: Settings, args: cli::TestSensorsArgs) -> Result<()> {
    // Individual sensor bodies are out of scope; this exercises the
    // registry lookup, config parsing, storage round-trip, and
    // result-validation contract a real sensor body would run through.
    let _config: serde_json::Value =
        serde_json::from_str(&args.config_json).context("parsing inline sensor config")?;
    let points = sensor_run::test_once(&args.sensor_name, "test", &settings.db_path).await?;
    for point in points {
        println!("{}", serde_json::to_string(&point)?);
    }
    Ok(())
}
