use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AudienceError;
use crate::value;

/// Declared type of a schema field or constraint operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Date,
    Duration,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Duration => "duration",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Number | DataType::Duration)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = AudienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(DataType::String),
            "number" => Ok(DataType::Number),
            "boolean" => Ok(DataType::Boolean),
            "date" => Ok(DataType::Date),
            "duration" => Ok(DataType::Duration),
            other => Err(AudienceError::validation(format!(
                "unknown data type '{other}'"
            ))),
        }
    }
}

/// An external identity linked to a profile (email, device id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub kind: String,
    pub value: String,
}

/// A stored profile and its trait bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub traits: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub identities: Vec<Identity>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_trait(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.traits.insert(key.into(), value);
        self
    }

    /// Resolve a raw attribute: built-in keys first, then traits (dotted
    /// paths descend into nested objects).
    pub fn attribute(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "id" | "profile_id" => return Some(serde_json::Value::String(self.id.clone())),
            "external_id" | "externalId" => {
                return self.external_id.clone().map(serde_json::Value::String)
            }
            _ => {}
        }
        if let Some(v) = self.traits.get(name) {
            return Some(v.clone());
        }
        if let Some(kind) = name.strip_prefix("identities.") {
            return self
                .identities
                .iter()
                .find(|i| i.kind == kind)
                .map(|i| serde_json::Value::String(i.value.clone()));
        }
        value::lookup_path(&self.traits, name).cloned()
    }
}

/// A single persisted event belonging to a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub profile_id: String,
    pub event_name: String,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        profile_id: impl Into<String>,
        event_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            event_name: event_name.into(),
            payload: HashMap::new(),
            timestamp,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload
            .get(name)
            .or_else(|| value::lookup_path(&self.payload, name))
    }
}
