//! DDP message framing.
//! - Client → server: connect, method, sub, unsub
//! - Server → client: connected, result, nosub, data, error
//!
//! Messages are JSON objects tagged by `msg`. Each raw frame is decoded once
//! into a typed variant at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Method {
        method: String,
        params: Vec<Value>,
        id: String,
    },
    Sub {
        id: String,
        name: String,
        params: Vec<Value>,
    },
    Unsub {
        id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },
    Data(DataMessage),
    Error {
        reason: String,
        #[serde(default, rename = "offendingMessage", skip_serializing_if = "Option::is_none")]
        offending_message: Option<Value>,
    },
}

/// Document-level update plus the subscription and method ids whose data is
/// complete as of this message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

/// Error payload carried by `result` and `nosub`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    /// Numeric or string error code.
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Errors the caller anticipated; stub failures marked this way are not logged.
    #[serde(skip)]
    pub expected: bool,
}

impl MethodError {
    pub fn new(error: impl Into<Value>, reason: impl Into<String>) -> Self {
        Self { error: error.into(), reason: Some(reason.into()), details: None, expected: false }
    }

    pub fn expected(mut self) -> Self {
        self.expected = true;
        self
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Value::String(s) => write!(f, "{s}")?,
            other => write!(f, "{other}")?,
        }
        if let Some(reason) = &self.reason {
            write!(f, " [{reason}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for MethodError {}

pub fn parse_server_message(raw: &str) -> Result<ServerMessage> {
    serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("bad server message: {e}")))
}
