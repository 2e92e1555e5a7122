//! Master/worker wire protocol
//!
//! Every worker event is a JSON object carrying the reserved `_event_name`
//! key next to its fields. The master answers every event with exactly one
//! reply: the literal string `"ack <event_name>"`, a JSON list of test ids
//! (answer to `need_tests`), or the string `"die"`.

use crate::runner::RunnerOptions;
use crate::types::{Location, TestId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Reserved key holding the event name
pub const EVENT_NAME_KEY: &str = "_event_name";

/// Terminal markup requested by a worker, e.g. `{"green": true}`
pub type Markup = BTreeMap<String, bool>;

/// Events sent from a worker to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_event_name")]
pub enum WorkerEvent {
    #[serde(rename = "message")]
    Message {
        message: String,
        #[serde(default)]
        markup: Markup,
    },

    #[serde(rename = "collectionfinish")]
    CollectionFinish { node_ids: Vec<TestId> },

    #[serde(rename = "need_tests")]
    NeedTests,

    #[serde(rename = "runtest_logstart")]
    RuntestLogstart { nodeid: TestId, location: Location },

    /// The report stays raw so a bad report can still be attributed
    #[serde(rename = "runtest_logreport")]
    RuntestLogreport { report: Value },

    #[serde(rename = "internalerror")]
    InternalError { message: String },

    #[serde(rename = "shutdown")]
    Shutdown,
}

impl WorkerEvent {
    /// Wire name of this event
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Message { .. } => "message",
            WorkerEvent::CollectionFinish { .. } => "collectionfinish",
            WorkerEvent::NeedTests => "need_tests",
            WorkerEvent::RuntestLogstart { .. } => "runtest_logstart",
            WorkerEvent::RuntestLogreport { .. } => "runtest_logreport",
            WorkerEvent::InternalError { .. } => "internalerror",
            WorkerEvent::Shutdown => "shutdown",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an event payload.
    ///
    /// Payloads that are not JSON objects, lack `_event_name`, or carry an
    /// unknown name or malformed fields are protocol errors.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let name = value
            .get(EVENT_NAME_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("missing {}", EVENT_NAME_KEY)))?
            .to_string();

        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("malformed {} event: {}", name, e)))
    }
}

/// Replies sent from the master to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterReply {
    /// Acknowledges the named event
    Ack(String),
    /// Tests to run next; empty means "no more work"
    Tests(Vec<TestId>),
    /// The worker must exit immediately
    Die,
}

impl MasterReply {
    pub fn ack(event_name: &str) -> Self {
        MasterReply::Ack(event_name.to_string())
    }

    pub fn to_value(&self) -> Value {
        match self {
            MasterReply::Ack(name) => Value::String(format!("ack {}", name)),
            MasterReply::Tests(tests) => {
                Value::Array(tests.iter().cloned().map(Value::String).collect())
            }
            MasterReply::Die => Value::String("die".to_string()),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "die" => Ok(MasterReply::Die),
            Value::String(s) => match s.strip_prefix("ack ") {
                Some(name) => Ok(MasterReply::Ack(name.to_string())),
                None => Err(Error::Protocol(format!("unexpected reply: {}", s))),
            },
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(id) => Ok(id),
                    other => Err(Error::Protocol(format!("bad test id: {}", other))),
                })
                .collect::<Result<Vec<_>>>()
                .map(MasterReply::Tests),
            other => Err(Error::Protocol(format!("unexpected reply: {}", other))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Self::from_value(serde_json::from_slice(payload)?)
    }
}

/// Configuration handed to every worker as `--config` JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Router endpoint of the master
    pub endpoint: PathBuf,

    /// Runner options of the master, with parallel-only flags stripped
    pub runner: RunnerOptions,

    /// Directory for the worker log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub debug: bool,
}

impl WorkerSettings {
    pub fn new(endpoint: impl Into<PathBuf>, runner: RunnerOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            runner,
            log_dir: None,
            debug: false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("bad worker config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_settings_json() {
        let settings = WorkerSettings::new("/tmp/cache/parallelize/42", RunnerOptions::default());
        let back = WorkerSettings::from_json(&settings.to_json().unwrap()).unwrap();
        assert_eq!(back, settings);
        assert!(matches!(
            WorkerSettings::from_json("{}"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_event_carries_reserved_name() {
        let event = WorkerEvent::CollectionFinish {
            node_ids: vec!["a.py::t1".to_string()],
        };
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value[EVENT_NAME_KEY], "collectionfinish");
        assert_eq!(value["node_ids"], json!(["a.py::t1"]));
    }

    #[test]
    fn test_unit_events_decode() {
        let event = WorkerEvent::decode(br#"{"_event_name": "need_tests"}"#).unwrap();
        assert_eq!(event, WorkerEvent::NeedTests);
        assert_eq!(event.name(), "need_tests");

        let event = WorkerEvent::decode(br#"{"_event_name": "shutdown"}"#).unwrap();
        assert_eq!(event, WorkerEvent::Shutdown);
    }

    #[test]
    fn test_message_markup_defaults_to_empty() {
        let event =
            WorkerEvent::decode(br#"{"_event_name": "message", "message": "hi"}"#).unwrap();
        match event {
            WorkerEvent::Message { message, markup } => {
                assert_eq!(message, "hi");
                assert!(markup.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_missing_name() {
        let err = WorkerEvent::decode(br#"{"node_ids": []}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_event() {
        let err = WorkerEvent::decode(br#"{"_event_name": "bogus"}"#).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            WorkerEvent::decode(b"not json").unwrap_err(),
            Error::Serialization(_)
        ));
    }

    #[test]
    fn test_ack_reply_is_literal_string() {
        let reply = MasterReply::ack("runtest_logreport");
        assert_eq!(reply.to_value(), json!("ack runtest_logreport"));
        assert_eq!(MasterReply::decode(&reply.encode().unwrap()).unwrap(), reply);
    }

    #[test]
    fn test_tests_and_die_replies() {
        let tests = MasterReply::Tests(vec!["a.py::t1".into(), "a.py::t2".into()]);
        assert_eq!(tests.to_value(), json!(["a.py::t1", "a.py::t2"]));
        assert_eq!(MasterReply::from_value(json!([])).unwrap(), MasterReply::Tests(vec![]));
        assert_eq!(MasterReply::from_value(json!("die")).unwrap(), MasterReply::Die);
        assert!(MasterReply::from_value(json!(42)).is_err());
    }
}
