//! Envelope - the JSON object relayed between peers

use crate::{FROM_USER_ID, TO_USER_ID};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Envelope body is blank")]
    Blank,

    #[error("Envelope is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Envelope has no toUserId")]
    MissingRecipient,

    #[error("Envelope toUserId must be a string")]
    InvalidRecipient,

    #[error("Envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Peer-to-peer message envelope
///
/// Only `fromUserId` and `toUserId` mean anything to the relay. Every other
/// field is carried through untouched and keeps its position in the object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    /// Parse an inbound text frame
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        if is_blank(raw) {
            return Err(EnvelopeError::Blank);
        }

        match serde_json::from_str::<Value>(raw).map_err(EnvelopeError::InvalidJson)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(EnvelopeError::NotAnObject(json_kind(&other))),
        }
    }

    /// Recipient id. Missing, null or blank ids are all "no recipient".
    pub fn to_user_id(&self) -> Result<&str, EnvelopeError> {
        match self.fields.get(TO_USER_ID) {
            None | Some(Value::Null) => Err(EnvelopeError::MissingRecipient),
            Some(Value::String(id)) if is_blank(id) => Err(EnvelopeError::MissingRecipient),
            Some(Value::String(id)) => Ok(id),
            Some(_) => Err(EnvelopeError::InvalidRecipient),
        }
    }

    /// Sender id as currently stored (client-supplied until stamped)
    pub fn from_user_id(&self) -> Option<&str> {
        self.fields.get(FROM_USER_ID).and_then(Value::as_str)
    }

    /// Overwrite the sender with the id the connection registered under
    pub fn stamp_sender(&mut self, from_user_id: &str) {
        self.fields.insert(
            FROM_USER_ID.to_string(),
            Value::String(from_user_id.to_string()),
        );
    }

    /// Serialize back into a text frame
    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(&self.fields).map_err(EnvelopeError::Encode)
    }
}

/// True for empty or whitespace-only text
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_stamp() {
        let mut envelope = Envelope::parse(r#"{"toUserId":"bob","text":"hi"}"#).unwrap();
        assert_eq!(envelope.to_user_id().unwrap(), "bob");
        assert_eq!(envelope.from_user_id(), None);

        envelope.stamp_sender("alice");
        assert_eq!(
            envelope.to_text().unwrap(),
            r#"{"toUserId":"bob","text":"hi","fromUserId":"alice"}"#
        );
    }

    #[test]
    fn test_stamp_overwrites_forged_sender() {
        let mut envelope =
            Envelope::parse(r#"{"fromUserId":"mallory","toUserId":"bob","text":"hi"}"#).unwrap();
        assert_eq!(envelope.from_user_id(), Some("mallory"));

        envelope.stamp_sender("alice");
        assert_eq!(envelope.from_user_id(), Some("alice"));
        // Position of the original key is kept
        assert_eq!(
            envelope.to_text().unwrap(),
            r#"{"fromUserId":"alice","toUserId":"bob","text":"hi"}"#
        );
    }

    #[test]
    fn test_opaque_fields_survive() {
        let raw = r#"{"toUserId":"bob","meta":{"n":[1,2,3]},"flag":true}"#;
        let mut envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.to_text().unwrap(), raw);

        envelope.stamp_sender("alice");
        assert_eq!(
            envelope.to_text().unwrap(),
            r#"{"toUserId":"bob","meta":{"n":[1,2,3]},"flag":true,"fromUserId":"alice"}"#
        );
    }

    #[test]
    fn test_blank_input() {
        assert!(matches!(Envelope::parse(""), Err(EnvelopeError::Blank)));
        assert!(matches!(Envelope::parse(" \n\t"), Err(EnvelopeError::Blank)));
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert!(matches!(
            Envelope::parse("[1,2]"),
            Err(EnvelopeError::NotAnObject("array"))
        ));
        assert!(matches!(
            Envelope::parse("\"hello\""),
            Err(EnvelopeError::NotAnObject("string"))
        ));
    }

    #[test]
    fn test_recipient_checks() {
        let missing = Envelope::parse(r#"{"text":"hi"}"#).unwrap();
        assert!(matches!(
            missing.to_user_id(),
            Err(EnvelopeError::MissingRecipient)
        ));

        let blank = Envelope::parse(r#"{"toUserId":"  "}"#).unwrap();
        assert!(matches!(
            blank.to_user_id(),
            Err(EnvelopeError::MissingRecipient)
        ));

        let numeric = Envelope::parse(r#"{"toUserId":42}"#).unwrap();
        assert!(matches!(
            numeric.to_user_id(),
            Err(EnvelopeError::InvalidRecipient)
        ));
    }
}
