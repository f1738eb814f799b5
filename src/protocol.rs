//! WebSocket wire format for the scoreboard server.
//!
//! Inbound (server → client), one JSON object per message:
//!
//! ```text
//! { "state": { "<path>": <value>, ... } }
//! ```
//!
//! Outbound (client → server), keys in sorted order:
//!
//! ```text
//! { "action": "Register", "paths": ["<path>", ...] }
//! { "action": "Set", "flag": "" | "change" | "reset", "key": "<path>", "value": <value> }
//! ```

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::json::JsonValue;
use crate::path::StatePath;

/// How a `Set` command should be applied by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Replace the value.
    #[default]
    #[serde(rename = "")]
    Replace,
    /// Adjust the value by the given delta.
    #[serde(rename = "change")]
    Delta,
    /// Reset to baseline (clock times).
    #[serde(rename = "reset")]
    Reset,
}

impl ChangeKind {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Replace => "",
            Self::Delta => "change",
            Self::Reset => "reset",
        }
    }
}

/// Client → server command. Field order matches sorted key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Command {
    Register {
        paths: Vec<StatePath>,
    },
    Set {
        #[serde(default)]
        flag: ChangeKind,
        key: StatePath,
        value: JsonValue,
    },
}

impl Command {
    pub fn register(paths: Vec<StatePath>) -> Self {
        Self::Register { paths }
    }

    pub fn set(key: StatePath, value: JsonValue, kind: ChangeKind) -> Self {
        Self::Set {
            flag: kind,
            key,
            value,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client diff frame. Entries keep the order they had on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateFrame {
    #[serde(deserialize_with = "ordered_entries")]
    pub state: Vec<(String, JsonValue)>,
}

impl StateFrame {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The entries with their keys parsed into paths.
    pub fn into_paths(self) -> impl Iterator<Item = (StatePath, JsonValue)> {
        self.state
            .into_iter()
            .map(|(key, value)| (StatePath::parse(&key), value))
    }
}

fn ordered_entries<'de, D>(deserializer: D) -> Result<Vec<(String, JsonValue)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntriesVisitor;

    impl<'de> Visitor<'de> for EntriesVisitor {
        type Value = Vec<(String, JsonValue)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of state paths to values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, JsonValue>()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor)
}

/// Percent-encode a query parameter value.
pub fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' | '/' => encoded.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).as_bytes() {
                    encoded.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    encoded
}
