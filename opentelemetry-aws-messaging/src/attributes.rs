//! Transport-neutral message attributes.
//!
//! SNS and SQS both carry metadata as a two-level map: attribute name to
//! `{data type, value}`. [`MessageAttributes`] models that map and doubles as
//! an OpenTelemetry [`Injector`] / [`Extractor`] carrier, so trace context can
//! be written into it and read back without knowing which service delivered
//! the message.
//!
//! The serde representation accepts both spellings seen on the wire: the SQS
//! event form (`dataType` / `stringValue`) and the SNS notification form
//! (`Type` / `Value`).

use std::collections::HashMap;

use opentelemetry::propagation::{Extractor, Injector};
use serde::{Deserialize, Serialize};

pub const STRING_DATA_TYPE: &str = "String";

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "dataType", alias = "Type", alias = "DataType")]
    pub data_type: String,
    #[serde(
        rename = "stringValue",
        alias = "Value",
        alias = "StringValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub string_value: Option<String>,
}

impl MessageAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: STRING_DATA_TYPE.to_string(),
            string_value: Some(value.into()),
        }
    }

    /// The value, when the attribute is a `String` (or custom `String.*`) type.
    pub fn as_str(&self) -> Option<&str> {
        let is_string = self.data_type == STRING_DATA_TYPE
            || self
                .data_type
                .strip_prefix(STRING_DATA_TYPE)
                .is_some_and(|custom| custom.starts_with('.'));
        if is_string {
            self.string_value.as_deref()
        } else {
            None
        }
    }
}

/// Attribute name to value map carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageAttributes(HashMap<String, MessageAttribute>);

impl MessageAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: MessageAttribute) {
        self.0.insert(name.into(), value);
    }

    pub fn insert_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(name, MessageAttribute::string(value));
    }

    pub fn get(&self, name: &str) -> Option<&MessageAttribute> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(MessageAttribute::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<MessageAttribute> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MessageAttribute)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, MessageAttribute)> for MessageAttributes {
    fn from_iter<I: IntoIterator<Item = (String, MessageAttribute)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Injector for MessageAttributes {
    fn set(&mut self, key: &str, value: String) {
        self.insert_string(key, value);
    }
}

impl Extractor for MessageAttributes {
    fn get(&self, key: &str) -> Option<&str> {
        self.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}
