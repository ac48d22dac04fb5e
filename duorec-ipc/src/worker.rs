//! Line protocol spoken with the worker subprocess.
//!
//! One JSON object per line, UTF-8, newline terminated, in both directions.
//! Requests carry an `id` generated by the client; responses echo it so they
//! can arrive in any order. Lines carrying `event` (and no `id`) are
//! unsolicited notifications.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_ERROR_MESSAGE: &str = "Unknown worker error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: String,
    pub action: String,
    pub payload: Value,
}

impl WorkerRequest {
    /// Serialized form including the trailing line terminator.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Everything the worker may write to stdout, loosely typed.
///
/// Any JSON value is accepted. A field of an unexpected type counts as
/// absent, so a malformed reply still resolves its request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerMessage {
    pub id: Option<String>,
    pub status: Option<String>,
    pub result: Option<Value>,
    /// `error.message`, when `error` is an object carrying a string message.
    pub error_message: Option<String>,
    pub event: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event { event: String, data: Value },
    Ready,
    Response {
        id: String,
        outcome: Result<Value, String>,
    },
    Ignored,
}

impl WorkerMessage {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        Ok(Self::from_value(serde_json::from_str(line)?))
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::default();
        };
        let error_message = match fields.remove("error") {
            Some(Value::Object(mut body)) => string(body.remove("message")),
            _ => None,
        };
        Self {
            id: string(fields.remove("id")),
            status: string(fields.remove("status")),
            result: fields.remove("result"),
            error_message,
            event: string(fields.remove("event")),
            data: fields.remove("data"),
        }
    }

    pub fn classify(self) -> Inbound {
        if let Some(event) = self.event {
            return Inbound::Event {
                event,
                data: self.data.unwrap_or(Value::Null),
            };
        }
        match self.id {
            Some(id) => {
                let outcome = if self.status.as_deref() == Some("ok") {
                    Ok(self.result.unwrap_or(Value::Null))
                } else {
                    Err(self
                        .error_message
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()))
                };
                Inbound::Response { id, outcome }
            }
            None if self.status.as_deref() == Some("ready") => Inbound::Ready,
            None => Inbound::Ignored,
        }
    }
}

fn string(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// A worker action with its request and response schema.
pub trait WorkerAction {
    const NAME: &'static str;
    type Payload: Serialize;
    type Output: DeserializeOwned;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentPayload {
    pub export_root: PathBuf,
    pub session_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentResult {
    pub path: PathBuf,
    pub session_dir: PathBuf,
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvPayload {
    pub csv_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub theme_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashIndexResult {
    pub count: u64,
    pub duplicates: Vec<DuplicateGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeRecord {
    pub theme_id: String,
    pub category: String,
    pub title: String,
    #[serde(rename = "role_A_prompt")]
    pub role_a_prompt: String,
    #[serde(rename = "role_B_prompt")]
    pub role_b_prompt: String,
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRecordsResult {
    pub items: Vec<ThemeRecord>,
}

pub struct GenerateConsentPdf;

impl WorkerAction for GenerateConsentPdf {
    const NAME: &'static str = "generate_consent_pdf";
    type Payload = ConsentPayload;
    type Output = ConsentResult;
}

pub struct ThemesHashIndex;

impl WorkerAction for ThemesHashIndex {
    const NAME: &'static str = "themes/hash-index";
    type Payload = CsvPayload;
    type Output = HashIndexResult;
}

pub struct ThemesLoadRecords;

impl WorkerAction for ThemesLoadRecords {
    const NAME: &'static str = "themes/load-records";
    type Payload = CsvPayload;
    type Output = LoadRecordsResult;
}

/// Actions accepted at the command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownAction {
    GenerateConsentPdf,
    ThemesHashIndex,
    ThemesLoadRecords,
}

impl KnownAction {
    pub fn name(self) -> &'static str {
        match self {
            KnownAction::GenerateConsentPdf => GenerateConsentPdf::NAME,
            KnownAction::ThemesHashIndex => ThemesHashIndex::NAME,
            KnownAction::ThemesLoadRecords => ThemesLoadRecords::NAME,
        }
    }

    /// Checks `payload` against the action's request schema.
    pub fn validate(self, payload: &Value) -> Result<(), String> {
        let checked = match self {
            KnownAction::GenerateConsentPdf => {
                serde_json::from_value::<ConsentPayload>(payload.clone()).map(drop)
            }
            KnownAction::ThemesHashIndex | KnownAction::ThemesLoadRecords => {
                serde_json::from_value::<CsvPayload>(payload.clone()).map(drop)
            }
        };
        checked.map_err(|e| format!("invalid payload for {}: {e}", self.name()))
    }
}

impl FromStr for KnownAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            KnownAction::GenerateConsentPdf,
            KnownAction::ThemesHashIndex,
            KnownAction::ThemesLoadRecords,
        ]
        .into_iter()
        .find(|action| action.name() == s)
        .ok_or_else(|| format!("Unknown action: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(line: &str) -> Inbound {
        WorkerMessage::parse(line).unwrap().classify()
    }

    #[test]
    fn request_line_is_newline_terminated() {
        let req = WorkerRequest {
            id: "1".into(),
            action: "themes/hash-index".into(),
            payload: json!({ "csv_path": "/tmp/t.csv" }),
        };
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn event_wins_over_everything_else() {
        assert_eq!(
            classify(r#"{"event":"progress","data":{"pct":40}}"#),
            Inbound::Event {
                event: "progress".into(),
                data: json!({ "pct": 40 }),
            }
        );
    }

    #[test]
    fn error_response_defaults_message() {
        assert_eq!(
            classify(r#"{"id":"x","status":"error"}"#),
            Inbound::Response {
                id: "x".into(),
                outcome: Err(DEFAULT_ERROR_MESSAGE.into()),
            }
        );
        assert_eq!(
            classify(r#"{"id":"x","status":"error","error":{"message":"nope"}}"#),
            Inbound::Response {
                id: "x".into(),
                outcome: Err("nope".into()),
            }
        );
    }

    #[test]
    fn mistyped_fields_still_resolve_the_request() {
        assert_eq!(
            classify(r#"{"id":"x","status":"error","error":"boom"}"#),
            Inbound::Response {
                id: "x".into(),
                outcome: Err(DEFAULT_ERROR_MESSAGE.into()),
            }
        );
        assert_eq!(
            classify(r#"{"id":"x","status":7,"error":{"message":42}}"#),
            Inbound::Response {
                id: "x".into(),
                outcome: Err(DEFAULT_ERROR_MESSAGE.into()),
            }
        );
        assert_eq!(
            classify(r#"{"id":"x","status":"ok","event":3}"#),
            Inbound::Response {
                id: "x".into(),
                outcome: Ok(Value::Null),
            }
        );
        assert_eq!(classify("[1,2]"), Inbound::Ignored);
    }

    #[test]
    fn ready_and_noise() {
        assert_eq!(classify(r#"{"status":"ready"}"#), Inbound::Ready);
        assert_eq!(classify(r#"{"hello":1}"#), Inbound::Ignored);
        assert!(WorkerMessage::parse("not json").is_err());
    }

    #[test]
    fn unknown_actions_are_rejected() {
        assert!("themes/drop-table".parse::<KnownAction>().is_err());
        let action: KnownAction = "themes/load-records".parse().unwrap();
        assert!(action.validate(&json!({ "csv_path": "a.csv" })).is_ok());
        assert!(action.validate(&json!({ "path": 3 })).is_err());
    }

    #[test]
    fn theme_record_keeps_worker_field_names() {
        let record: ThemeRecord = serde_json::from_value(json!({
            "theme_id": "T1",
            "category": "daily",
            "title": "Hello",
            "role_A_prompt": "ask",
            "role_B_prompt": "answer",
            "hints": ["a"]
        }))
        .unwrap();
        assert_eq!(record.role_a_prompt, "ask");
    }
}
