use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::now_unix_millis;
use crate::token::TokenId;

static EVENT_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)*$").unwrap());

/// An external event: hierarchical dotted type, numeric payload, priority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub event_type: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "now_unix_millis")]
    pub timestamp_ms: u64,
}

impl Signal {
    pub fn new(event_type: impl Into<String>, vector: Vec<f32>, priority: u8) -> Self {
        Self {
            event_type: event_type.into(),
            vector,
            priority,
            timestamp_ms: now_unix_millis(),
        }
    }
}

/// Trim and lowercase an event type, then check the dotted grammar and,
/// when `allowed_namespaces` is non-empty, the first segment.
pub fn normalize_event_type(raw: &str, allowed_namespaces: &[String]) -> Result<String> {
    let event_type = raw.trim().to_ascii_lowercase();
    if event_type.is_empty() {
        return Err(Error::InvalidSignal("empty event type".into()));
    }
    if !EVENT_TYPE.is_match(&event_type) {
        return Err(Error::InvalidSignal(format!("malformed event type '{raw}'")));
    }
    if !allowed_namespaces.is_empty() {
        let namespace = event_type.split('.').next().unwrap_or_default();
        if !allowed_namespaces.iter().any(|ns| ns == namespace) {
            return Err(Error::InvalidSignal(format!("unknown namespace '{namespace}'")));
        }
    }
    Ok(event_type)
}

/// What subscribers see for every routed signal.
#[derive(Clone, Copy, Debug)]
pub struct SignalEvent<'a> {
    pub event_type: &'a str,
    pub vector: &'a [f32],
    pub priority: u8,
    pub timestamp_ms: u64,
    pub token_id: TokenId,
    pub is_novel: bool,
    pub fast_path: bool,
}
