//! Scripted commands against a charge point
//!
//! One JSON object per line, tagged by `"command"`:
//!
//! ```text
//! # comments and blank lines are skipped
//! {"command": "connect"}
//! {"command": "send", "action": "BootNotification", "payload": {"chargePointVendor": "Acme", "chargePointModel": "Sim-1"}}
//! {"command": "sleep", "millis": 500}
//! {"command": "respond", "messageId": "abc", "payload": {"status": "Accepted"}}
//! {"command": "log", "message": "done"}
//! {"command": "close"}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::chargepoint::ChargePoint;
use crate::ocpp::messages::{Action, OcppError};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    Connect,
    Reconnect,
    Close,
    Sleep {
        millis: u64,
    },
    /// Outbound call; the reply payload is the command's result
    Send {
        action: Action,
        #[serde(default = "empty_object")]
        payload: Value,
    },
    /// Answer an inbound call
    #[serde(rename_all = "camelCase")]
    Respond {
        message_id: String,
        payload: Value,
    },
    Log {
        message: String,
    },
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Reconnect => "reconnect",
            Command::Close => "close",
            Command::Sleep { .. } => "sleep",
            Command::Send { .. } => "send",
            Command::Respond { .. } => "respond",
            Command::Log { .. } => "log",
        }
    }

    /// Run against a charge point; commands without a result yield `null`
    pub async fn execute(&self, cp: &ChargePoint) -> Result<Value, OcppError> {
        match self {
            Command::Connect => cp.connect().await?,
            Command::Reconnect => cp.reconnect().await?,
            Command::Close => cp.close().await,
            Command::Sleep { millis } => cp.sleep(Duration::from_millis(*millis)).await,
            Command::Send { action, payload } => {
                return cp.call_raw(*action, payload.clone()).await;
            }
            Command::Respond {
                message_id,
                payload,
            } => cp.send_response(message_id, payload)?,
            Command::Log { message } => cp.log(message),
        }
        Ok(Value::Null)
    }
}

/// Parse a script, one command per line
pub fn parse_script(text: &str) -> Result<Vec<Command>, ScriptError> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line, source)| {
            serde_json::from_str(source).map_err(|source| ScriptError::Parse { line, source })
        })
        .collect()
}
