//! OCPP 1.6 JSON message framing
//!
//! Every WebSocket text frame carries one JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!   or the compact [4, messageId, payload] some central systems send

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 RPC framework error codes
///
/// Spelling follows the 1.6 JSON specification, including its
/// `FormationViolation` and `OccurenceConstraintViolation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names understood by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CS
    Heartbeat,
    BootNotification,
    StatusNotification,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    SignCertificate,

    // CS -> CP
    GetDiagnostics,
    UpdateFirmware,
    Reset,
    GetConfiguration,
    ChangeConfiguration,
    ChangeAvailability,
    CertificateSigned,
    RemoteStartTransaction,
    RemoteStopTransaction,
    TriggerMessage,
    ExtendedTriggerMessage,

    // Bidirectional
    DataTransfer,
}

impl Action {
    pub const ALL: [Action; 22] = [
        Action::Heartbeat,
        Action::BootNotification,
        Action::StatusNotification,
        Action::Authorize,
        Action::StartTransaction,
        Action::StopTransaction,
        Action::MeterValues,
        Action::DiagnosticsStatusNotification,
        Action::FirmwareStatusNotification,
        Action::SignCertificate,
        Action::GetDiagnostics,
        Action::UpdateFirmware,
        Action::Reset,
        Action::GetConfiguration,
        Action::ChangeConfiguration,
        Action::ChangeAvailability,
        Action::CertificateSigned,
        Action::RemoteStartTransaction,
        Action::RemoteStopTransaction,
        Action::TriggerMessage,
        Action::ExtendedTriggerMessage,
        Action::DataTransfer,
    ];

    /// Whether the charge point may initiate this action
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Action::Heartbeat
                | Action::BootNotification
                | Action::StatusNotification
                | Action::Authorize
                | Action::StartTransaction
                | Action::StopTransaction
                | Action::MeterValues
                | Action::DiagnosticsStatusNotification
                | Action::FirmwareStatusNotification
                | Action::SignCertificate
                | Action::DataTransfer
        )
    }

    /// Whether the central system may initiate this action
    pub fn is_inbound(&self) -> bool {
        !self.is_outbound() || *self == Action::DataTransfer
    }

    /// The two actions routed through the requested-message sub-registry
    pub fn is_trigger(&self) -> bool {
        matches!(self, Action::TriggerMessage | Action::ExtendedTriggerMessage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Heartbeat => "Heartbeat",
            Action::BootNotification => "BootNotification",
            Action::StatusNotification => "StatusNotification",
            Action::Authorize => "Authorize",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::MeterValues => "MeterValues",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::SignCertificate => "SignCertificate",
            Action::GetDiagnostics => "GetDiagnostics",
            Action::UpdateFirmware => "UpdateFirmware",
            Action::Reset => "Reset",
            Action::GetConfiguration => "GetConfiguration",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::CertificateSigned => "CertificateSigned",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::TriggerMessage => "TriggerMessage",
            Action::ExtendedTriggerMessage => "ExtendedTriggerMessage",
            Action::DataTransfer => "DataTransfer",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| OcppError::UnknownAction {
                message_id: None,
                action: s.to_string(),
            })
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Unknown action: {action}")]
    UnknownAction {
        message_id: Option<String>,
        action: String,
    },

    #[error("Action {0} is not valid in this direction")]
    UnexpectedDirection(Action),

    #[error("Invalid handler registration: {0}")]
    InvalidRegistration(String),

    #[error("CALLERROR from central system: {code} - {description}")]
    CallError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("Timeout waiting for {action} response ({message_id})")]
    Timeout { action: Action, message_id: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Connection not open")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with a fresh v4 UUID message id
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.as_str(),
            &self.payload
        ])
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ])
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Arity of a CALLERROR frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallErrorForm {
    /// [4, messageId, errorCode, errorDescription, errorDetails]
    #[default]
    Full,
    /// [4, messageId, payload]; the payload is kept in `error_details`
    Compact,
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub form: CallErrorForm,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            form: CallErrorForm::Full,
        }
    }

    /// Build from the compact `[4, messageId, payload]` form.
    ///
    /// `errorCode` and `errorDescription` are read from the payload when
    /// present; the payload itself becomes the details.
    pub fn from_payload(message_id: impl Into<String>, payload: Value) -> Self {
        let message_id = message_id.into();
        let error_code = match payload.get("errorCode") {
            Some(code) => decode_error_code(&message_id, code),
            None => ErrorCode::GenericError,
        };
        let error_description = payload
            .get("errorDescription")
            .map(|description| decode_description(&message_id, description))
            .unwrap_or_default();

        Self {
            message_id,
            error_code,
            error_description,
            error_details: payload,
            form: CallErrorForm::Compact,
        }
    }

    pub fn to_value(&self) -> Value {
        match self.form {
            CallErrorForm::Full => serde_json::json!([
                MessageType::CallError as i32,
                &self.message_id,
                self.error_code.to_string(),
                &self.error_description,
                &self.error_details
            ]),
            CallErrorForm::Compact => serde_json::json!([
                MessageType::CallError as i32,
                &self.message_id,
                &self.error_details
            ]),
        }
    }

    /// Serialize to OCPP wire format, keeping the form it was built with
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Convert into the error handed to whoever awaits the original call
    pub fn into_error(self) -> OcppError {
        OcppError::CallError {
            code: self.error_code,
            description: self.error_description,
            details: self.error_details,
        }
    }
}

fn decode_error_code(message_id: &str, code: &Value) -> ErrorCode {
    match serde_json::from_value(code.clone()) {
        Ok(code) => code,
        Err(_) => {
            debug!("CALLERROR {}: error code {} read as GenericError", message_id, code);
            ErrorCode::GenericError
        }
    }
}

fn decode_description(message_id: &str, description: &Value) -> String {
    match description.as_str() {
        Some(text) => text.to_string(),
        None => {
            debug!("CALLERROR {}: non-string description {} dropped", message_id, description);
            String::new()
        }
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Decode an already parsed JSON array
    pub fn from_value(value: Value) -> Result<Self, OcppError> {
        let array = match value {
            Value::Array(array) => array,
            _ => return Err(OcppError::InvalidFormat),
        };

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        let message_id = || -> Result<String, OcppError> {
            array
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(OcppError::InvalidFormat)
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }
                let message_id = message_id()?;
                let action_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let action: Action = action_str.parse().map_err(|_| OcppError::UnknownAction {
                    message_id: Some(message_id.clone()),
                    action: action_str.to_string(),
                })?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id()?,
                    payload: array[2].clone(),
                }))
            }
            4 => match array.len() {
                3 => Ok(OcppMessage::CallError(CallError::from_payload(
                    message_id()?,
                    array[2].clone(),
                ))),
                5 => {
                    let message_id = message_id()?;
                    if !array[2].is_string() {
                        return Err(OcppError::InvalidFormat);
                    }
                    let error_code = decode_error_code(&message_id, &array[2]);
                    let error_description = decode_description(&message_id, &array[3]);

                    Ok(OcppMessage::CallError(CallError {
                        message_id,
                        error_code,
                        error_description,
                        error_details: array[4].clone(),
                        form: CallErrorForm::Full,
                    }))
                }
                _ => Err(OcppError::InvalidFormat),
            },
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            OcppMessage::Call(c) => c.to_value(),
            OcppMessage::CallResult(r) => r.to_value(),
            OcppMessage::CallError(e) => e.to_value(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    /// Serialize to the text carried by one WebSocket frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_value())?)
    }
}
