//! OCPP 1.6 JSON protocol layer
//!
//! - `types`: payload types for every supported action
//! - `messages`: wire framing (CALL, CALLRESULT, CALLERROR) and `OcppError`
//! - `correlation`: single outstanding call, deferred queue and timeouts
//! - `dispatch`: handler registry for central-system initiated calls
//! - `connection`: WebSocket transport and its lifecycle

pub mod types;
pub mod messages;
pub mod correlation;
pub mod dispatch;
pub mod connection;

pub use messages::*;
pub use correlation::{Correlator, DEFAULT_RESPONSE_TIMEOUT};
pub use dispatch::{BoxError, Dispatch, HandlerResult, PayloadTransform, Registry, Responder};
pub use connection::{CallRouter, Connection, ConnectionState, OCPP_SUBPROTOCOL};
