use crate::jobs::ClassificationResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted control line, newline excluded
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Message types on the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Task to server
    Connected,
    Heartbeat,
    Configure,
    ClassifierOn,
    ClassifierOff,
    Encoding,
    ReadOnlyState,

    // Server to task
    ConnectedOk,
    HeartbeatOk,
    ConfigureOk,
    ErrorInConfiguration,
    ErrorInConfigFile,
    ClassifierResult,
    Error,
}

impl MessageType {
    const ALL: [MessageType; 14] = [
        MessageType::Connected,
        MessageType::Heartbeat,
        MessageType::Configure,
        MessageType::ClassifierOn,
        MessageType::ClassifierOff,
        MessageType::Encoding,
        MessageType::ReadOnlyState,
        MessageType::ConnectedOk,
        MessageType::HeartbeatOk,
        MessageType::ConfigureOk,
        MessageType::ErrorInConfiguration,
        MessageType::ErrorInConfigFile,
        MessageType::ClassifierResult,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connected => "CONNECTED",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Configure => "CONFIGURE",
            MessageType::ClassifierOn => "CLASSIFIER_ON",
            MessageType::ClassifierOff => "CLASSIFIER_OFF",
            MessageType::Encoding => "ENCODING",
            MessageType::ReadOnlyState => "READ_ONLY_STATE",
            MessageType::ConnectedOk => "CONNECTED_OK",
            MessageType::HeartbeatOk => "HEARTBEAT_OK",
            MessageType::ConfigureOk => "CONFIGURE_OK",
            MessageType::ErrorInConfiguration => "ERROR_IN_CONFIGURATION",
            MessageType::ErrorInConfigFile => "ERROR_IN_CONFIG_FILE",
            MessageType::ClassifierResult => "CLASSIFIER_RESULT",
            MessageType::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Wire shape; `time` and `data` are optional inbound
#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    data: Option<Value>,
}

/// One control-protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub kind: MessageType,
    /// Seconds since the Unix epoch
    pub time: f64,
    pub data: Map<String, Value>,
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

impl TaskMessage {
    pub fn new(kind: MessageType) -> Self {
        Self::with_data(kind, Map::new())
    }

    pub fn with_data(kind: MessageType, data: Map<String, Value>) -> Self {
        Self {
            kind,
            time: now_seconds(),
            data,
        }
    }

    /// A failure response carrying `{"error": reason}`
    pub fn failure(kind: MessageType, reason: impl fmt::Display) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(reason.to_string()));
        Self::with_data(kind, data)
    }

    pub fn error(reason: impl fmt::Display) -> Self {
        Self::failure(MessageType::Error, reason)
    }

    pub fn classifier_result(result: &ClassificationResult) -> Self {
        let data = match serde_json::to_value(result) {
            Ok(Value::Object(data)) => data,
            _ => Map::new(),
        };
        Self::with_data(MessageType::ClassifierResult, data)
    }

    /// Parse one line (without its newline)
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_str(line)?;
        let kind = wire.kind.parse()?;
        let data = match wire.data {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "data",
                    reason: format!("expected an object, got {}", other),
                })
            }
        };

        Ok(Self {
            kind,
            time: wire.time.unwrap_or_else(now_seconds),
            data,
        })
    }

    /// Serialize to one newline-terminated line
    pub fn to_line(&self) -> String {
        let mut line = Value::Object(Map::from_iter([
            ("type".to_string(), Value::String(self.kind.as_str().to_string())),
            ("time".to_string(), Value::from(self.time)),
            ("data".to_string(), Value::Object(self.data.clone())),
        ]))
        .to_string();
        line.push('\n');
        line
    }

    /// Optional boolean field of `data`
    pub fn flag(&self, field: &'static str) -> Result<Option<bool>, ProtocolError> {
        match self.data.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(other) => Err(ProtocolError::InvalidField {
                field,
                reason: format!("expected a boolean, got {}", other),
            }),
        }
    }
}

/// Read one newline-terminated line of at most [`MAX_LINE_BYTES`].
///
/// `Ok(None)` means the peer closed the connection. A final line without a
/// trailing newline is still returned.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::LineTooLong);
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidUtf8)
}
