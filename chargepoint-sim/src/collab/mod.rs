//! External collaborators
//!
//! The engine talks to everything outside the protocol through these traits:
//! a telemetry sink, a push-only observation console, a keystore of TLS client
//! credentials, a file-transfer helper and a CSR generator. Telemetry, console
//! and keystore have defaults; file transfer and CSR generation are optional
//! and fail with `OcppError::Collaborator` when not configured.

pub mod console;
pub mod keystore;
pub mod pki;
pub mod telemetry;
pub mod transfer;

pub use console::{BroadcastConsole, ConsoleEvent, ConsoleSink, NullConsole};
pub use keystore::{KeyPair, KeyStore, StaticKeyStore, KEYSTORE_ENV};
pub use pki::{Csr, CsrGenerator, OpensslCsrGenerator};
pub use telemetry::{ChannelTelemetry, TelemetryRecord, TelemetrySink, TracingTelemetry};
pub use transfer::{FileTransfer, FtpLocation};
