//! # Charge Point Simulator
//!
//! OCPP 1.6 JSON charge point engine for exercising central systems.
//!
//! A simulated charge point keeps one WebSocket to its central system and
//! enforces the protocol's single outstanding call: outbound requests queue
//! behind the one in flight, and a call interrupted by a reconnect goes out
//! again with the same message id.
//!
//! ## Architecture
//!
//! ```text
//! Scenario / CLI script
//!       │ ChargePoint / Command
//!       ▼
//! ┌──────────────────────────────────────┐
//! │  ChargePoint                         │
//! │  ┌────────────┐   ┌───────────────┐  │
//! │  │ Correlator │   │ Registry      │  │
//! │  │ slot+queue │   │ action→handler│  │
//! │  └─────┬──────┘   └───────▲───────┘  │
//! │        │   Connection     │          │
//! │        └──────►ws◄────────┘          │
//! └────────────────┬─────────────────────┘
//!                  │ WebSocket, subprotocol ocpp1.6
//!                  ▼
//!           Central System
//! ```
//!
//! Telemetry, the observation console, the TLS keystore, file transfer and
//! CSR generation are collaborators behind the traits in [`collab`].
//!
//! ## Usage
//!
//! ```no_run
//! use chargepoint_sim::ChargePoint;
//! use chargepoint_sim::ocpp::types::{BootNotificationRequest, GetDiagnosticsResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cp = ChargePoint::builder("ws://localhost:8180/steve/websocket/CentralSystemService/CP-1")
//!         .build()?;
//!
//!     cp.on_get_diagnostics(|cp, req| async move {
//!         let response = GetDiagnosticsResponse { file_name: Some("diag.txt".into()) };
//!         cp.send_response(&req.message_id, response)?;
//!         Ok(())
//!     })?;
//!
//!     cp.connect().await?;
//!     cp.boot_notification(BootNotificationRequest::new("Acme", "Sim-1")).await?;
//!     cp.heartbeat().await?;
//!     cp.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod collab;
pub mod cert;
pub mod command;
pub mod chargepoint;

pub use config::{ChargePointConfig, ConfigError};
pub use chargepoint::{ChargePoint, ChargePointBuilder, Inbound};
pub use command::{parse_script, Command, ScriptError};
pub use cert::CertificatePemTransform;

// Re-export key types
pub use ocpp::{Action, Call, CallResult, ConnectionState, ErrorCode, OcppError, OcppMessage};
