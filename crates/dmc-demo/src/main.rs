//! DMC demo: drives one device through profile verification and a
//! lock / unlock / wipe cycle against the logging transport.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dmc_core::{
    actions::DeviceActionService,
    audit::{AuditLogger, FileAuditSink, MemoryAuditSink},
    config::ControlPlaneConfig,
    correlator::{CommandOutcome, ResultCorrelator},
    harness::make_device,
    repair::RepairQueue,
    store::{InMemoryStore, Store},
    transport::LoggingTransport,
    types::{
        ActionKind, Channel, ExpectedProfile, InstalledProfile, InstalledProfileReport, Platform,
        ProtocolStatus,
    },
    verification::ProfileVerifier,
};

#[derive(Parser, Debug)]
#[command(name = "dmc-demo", about = "Walk a device through verification and remote actions")]
struct Args {
    /// TOML config file; defaults plus DMC_* environment overrides otherwise
    #[arg(short, long, env = "DMC_CONFIG")]
    config: Option<PathBuf>,

    /// Platform of the simulated device
    #[arg(short, long, default_value = "macos")]
    platform: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let mut config = ControlPlaneConfig::load_from_file(path)?;
            config.apply_env();
            config
        }
        None => ControlPlaneConfig::load_from_env(),
    };
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let platform: Platform = args
        .platform
        .parse()
        .map_err(anyhow::Error::msg)
        .context("invalid --platform")?;

    let store = open_store(&config)?;
    let memory_sink = Arc::new(MemoryAuditSink::new(256));
    let mut audit = AuditLogger::new().with_sink(memory_sink.clone());
    if let Some(path) = &config.audit_log {
        audit.add_sink(Arc::new(FileAuditSink::new(path)));
    }

    let repairs = RepairQueue::new();
    let actions = DeviceActionService::from_config(store.clone(), Arc::new(LoggingTransport), &config)
        .with_audit(audit.clone())
        .with_repairs(repairs.clone());
    let correlator = ResultCorrelator::from_config(store.clone(), &config)
        .with_audit(audit.clone())
        .with_repairs(repairs);
    let verifier = ProfileVerifier::from_config(store.clone(), &config).with_audit(audit);

    let device = make_device(platform);
    store.save_device(device.clone()).await?;
    info!(device_id = %device.id, hostname = %device.hostname, "Seeded device");

    // Profile verification: one profile delivered, one still missing.
    let earliest = Utc::now() - Duration::hours(1);
    store
        .set_expected_profiles(
            &device.id,
            vec![
                ExpectedProfile {
                    identifier: "com.example.wifi".into(),
                    earliest_install_date: earliest,
                },
                ExpectedProfile {
                    identifier: "com.example.vpn".into(),
                    earliest_install_date: earliest,
                },
            ],
        )
        .await?;
    let mut report = InstalledProfileReport::new();
    report.insert(
        "com.example.wifi".into(),
        InstalledProfile {
            install_date: Utc::now(),
        },
    );
    for round in 1..=2 {
        let update = verifier.ingest_check_in(&device, report.clone()).await?;
        println!(
            "check-in {round}: verified={:?} retry={:?} failed={:?}",
            update.verified, update.retry, update.failed
        );
    }

    // Lock, acknowledge, unlock, acknowledge, wipe.
    for kind in [ActionKind::Lock, ActionKind::Unlock, ActionKind::Wipe] {
        let receipt = actions.request_action(&device.id, kind).await?;
        println!("{}: {}", kind, receipt.hint);
        if let Some(pin) = &receipt.unlock_pin {
            println!("  unlock PIN: {pin}");
        }

        let outcome = match receipt.channel {
            Channel::Protocol => CommandOutcome::Protocol(ProtocolStatus::Acknowledged),
            Channel::Script => CommandOutcome::Script {
                exit_code: Some(0),
                output: None,
            },
            // Nothing was sent; the action is already complete.
            Channel::None => continue,
        };
        let recorded = correlator.record_result(&receipt.correlation_id, outcome).await?;
        println!("  result: {:?}", recorded);
    }

    let status = correlator.device_status(&device.id).await?;
    println!(
        "final state: locked={} wiped={} pending={}",
        status.locked,
        status.wiped,
        status.pending.is_some()
    );
    for event in memory_sink.events().await {
        println!("audit: {}", event.to_log_line());
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
fn open_store(config: &ControlPlaneConfig) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database_path {
        Some(path) => {
            let store = dmc_core::sqlite_store::SqliteStore::new(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
fn open_store(config: &ControlPlaneConfig) -> anyhow::Result<Arc<dyn Store>> {
    if config.database_path.is_some() {
        anyhow::bail!("database_path is set but dmc-demo was built without the sqlite feature");
    }
    Ok(Arc::new(InMemoryStore::new()))
}
