//! Charge Point Simulator Node - CLI for one simulated charge point
//!
//! Connects a single OCPP 1.6 charge point to a central system and either
//! runs a command script or a default session (boot, status, heartbeats).
//!
//! # Usage
//!
//! ```bash
//! # Default session against a local SteVe
//! chargepoint-sim-node --url ws://localhost:8180/steve/websocket/CentralSystemService/CP-1
//!
//! # Run a script, one JSON command per line
//! chargepoint-sim-node --url ws://localhost:8100/CP-7 --script session.jsonl
//!
//! # Shorter response timeout
//! RESPONSE_TIMEOUT=2000 chargepoint-sim-node --url ws://localhost:8100/CP-7
//! ```
//!
//! For `wss://` URLs the client key and certificate are looked up in the
//! `SSL_CLIENT_KEYSTORE` JSON array (`[{"id", "key", "cert"}]`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chargepoint_sim::collab::{OpensslCsrGenerator, StaticKeyStore};
use chargepoint_sim::ocpp::types::*;
use chargepoint_sim::{parse_script, CertificatePemTransform, ChargePoint, ChargePointConfig};
use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Simulated OCPP 1.6 charge point
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system WebSocket URL, ending with the charge point identity
    #[arg(short, long, default_value = "ws://localhost:8180/steve/websocket/CentralSystemService/CP-1")]
    url: String,

    /// Identity, if it differs from the last URL segment
    #[arg(short, long)]
    identity: Option<String>,

    /// Command script (JSON lines); without it a default session runs
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Response timeout in milliseconds (overrides RESPONSE_TIMEOUT)
    #[arg(long)]
    response_timeout_ms: Option<u64>,

    /// WebSocket handshake timeout in milliseconds
    #[arg(long, default_value = "30000")]
    connect_timeout_ms: u64,

    /// Vendor name
    #[arg(long, default_value = "vendor")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "1")]
    model: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ChargePointConfig::new(&args.url)
        .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms))
        .apply_env()?;
    if let Some(millis) = args.response_timeout_ms {
        config = config.with_response_timeout(Duration::from_millis(millis));
    }
    if let Some(identity) = &args.identity {
        config = config.with_identity(identity);
    }

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          Charge Point Simulator - OCPP 1.6 JSON              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Identity: {:<50} ║", truncate(&config.identity, 50));
    println!("║  URL:      {:<50} ║", truncate(&config.url, 50));
    println!("║  Timeout:  {:<50} ║", format!("{} ms", config.response_timeout.as_millis()));
    println!(
        "║  Mode:     {:<50} ║",
        args.script
            .as_ref()
            .map(|p| truncate(&p.display().to_string(), 50))
            .unwrap_or_else(|| "default session".to_string())
    );
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let keystore = StaticKeyStore::from_env()?;
    if !keystore.is_empty() {
        info!("Loaded {} keystore entries", keystore.len());
    }

    let cp = ChargePoint::builder(&args.url)
        .config(config)
        .keystore(Arc::new(keystore))
        .csr_generator(Arc::new(OpensslCsrGenerator::default()))
        .build()?;
    register_handlers(&cp, &args)?;

    match &args.script {
        Some(path) => run_script(&cp, path).await?,
        None => run_default_session(&cp, &args).await?,
    }

    cp.shutdown().await;
    info!("Done");
    Ok(())
}

fn boot_request(args: &Args) -> BootNotificationRequest {
    BootNotificationRequest::new(&args.vendor, &args.model)
}

/// Handlers a simulated charge point answers out of the box
fn register_handlers(cp: &ChargePoint, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    cp.on_get_diagnostics(|cp, req| async move {
        let file_name = format!("foo.{}.txt", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"));
        cp.send_response(
            &req.message_id,
            GetDiagnosticsResponse {
                file_name: Some(file_name.clone()),
            },
        )?;

        cp.diagnostics_status_notification(DiagnosticsStatus::Idle).await?;
        cp.sleep(Duration::from_secs(5)).await;
        cp.diagnostics_status_notification(DiagnosticsStatus::Uploading).await?;
        match cp.ftp_upload_dummy_file(&req.payload.location, &file_name).await {
            Ok(()) => {
                cp.diagnostics_status_notification(DiagnosticsStatus::Uploaded).await?;
            }
            Err(e) => {
                warn!("[{}] Diagnostics upload failed: {}", cp.identity(), e);
                cp.diagnostics_status_notification(DiagnosticsStatus::UploadFailed).await?;
            }
        }
        Ok(())
    })?;

    cp.on_update_firmware(|cp, req| async move {
        cp.send_response(&req.message_id, UpdateFirmwareResponse {})?;

        cp.firmware_status_notification(FirmwareStatus::Idle).await?;
        cp.sleep(Duration::from_secs(5)).await;
        cp.firmware_status_notification(FirmwareStatus::Downloading).await?;
        let file = match cp.ftp_download(&req.payload.location).await {
            Ok(file) => file,
            Err(e) => {
                warn!("[{}] Firmware download failed: {}", cp.identity(), e);
                cp.firmware_status_notification(FirmwareStatus::DownloadFailed).await?;
                return Ok(());
            }
        };
        cp.log(format!("file downloaded to: {}", file.display()));
        cp.firmware_status_notification(FirmwareStatus::Downloaded).await?;
        cp.sleep(Duration::from_secs(5)).await;
        cp.firmware_status_notification(FirmwareStatus::Installing).await?;
        cp.sleep(Duration::from_secs(5)).await;
        cp.firmware_status_notification(FirmwareStatus::Installed).await?;
        Ok(())
    })?;

    let boot = boot_request(args);
    cp.on_reset(move |cp, req| {
        let boot = boot.clone();
        async move {
            cp.send_response(
                &req.message_id,
                ResetResponse {
                    status: GenericStatus::Accepted,
                },
            )?;
            cp.log(format!("RESET ***boing-boing-boing*** {:?}", req.payload.reset_type));
            cp.boot_notification(boot).await?;
            Ok(())
        }
    })?;

    cp.on_certificate_signed(Some(Arc::new(CertificatePemTransform)), |cp, req| async move {
        let count = req.payload.cert.as_ref().map(Vec::len).unwrap_or(0)
            + usize::from(req.payload.certificate_chain.is_some());
        cp.log(format!("received {} certificate(s)", count));
        cp.send_response(
            &req.message_id,
            CertificateSignedResponse {
                status: GenericStatus::Accepted,
            },
        )?;
        Ok(())
    })?;

    cp.on_trigger_message(MessageTrigger::Heartbeat, |cp, req| async move {
        cp.send_response(
            &req.message_id,
            TriggerMessageResponse {
                status: TriggerMessageStatus::Accepted,
            },
        )?;
        cp.heartbeat().await?;
        Ok(())
    })?;

    cp.on_trigger_message(MessageTrigger::StatusNotification, |cp, req| async move {
        cp.send_response(
            &req.message_id,
            TriggerMessageResponse {
                status: TriggerMessageStatus::Accepted,
            },
        )?;
        let connector = req.payload.connector_id.unwrap_or(0);
        cp.status_notification(StatusNotificationRequest::new(
            connector,
            ChargePointStatus::Available,
        ))
        .await?;
        Ok(())
    })?;

    Ok(())
}

/// Execute a script; a failing command is logged and the script goes on
async fn run_script(cp: &ChargePoint, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = tokio::fs::read_to_string(path).await?;
    let commands = parse_script(&text)?;
    info!("Running {} commands from {}", commands.len(), path.display());

    for (index, command) in commands.iter().enumerate() {
        match command.execute(cp).await {
            Ok(serde_json::Value::Null) => info!("#{} {}: ok", index + 1, command.name()),
            Ok(result) => info!("#{} {}: {}", index + 1, command.name(), result),
            Err(e) => error!("#{} {} failed: {}", index + 1, command.name(), e),
        }
    }
    Ok(())
}

/// Boot, report connectors available, then heartbeat until Ctrl-C
async fn run_default_session(cp: &ChargePoint, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("Connecting to central system...");
    cp.connect().await?;

    let boot = cp.boot_notification(boot_request(args)).await?;
    info!("BootNotification: {:?}, interval {}s", boot.status, boot.interval);

    cp.heartbeat().await?;
    for connector in 0..=1 {
        cp.status_notification(StatusNotificationRequest::new(
            connector,
            ChargePointStatus::Available,
        ))
        .await?;
    }

    let interval = Duration::from_secs(boot.interval.max(1) as u64);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = cp.heartbeat().await {
                    warn!("Heartbeat failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }
    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
