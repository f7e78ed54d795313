//! Self-describing bus messages
//!
//! A message carries its own addressing (send subject and optional reply
//! subject) and an ordered list of named, typed fields. Nested messages let
//! the virtual circuit layer wrap application traffic without a second format.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Field Types
// ----------------------------------------------------------------------------

/// Typed value stored in a message field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    U32(u32),
    String(String),
    Message(Box<Message>),
}

/// A named field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A message as it travels over the bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    send_subject: Option<String>,
    reply_subject: Option<String>,
    fields: Vec<Field>,
}

impl Message {
    /// Create an empty, unaddressed message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty message addressed to `subject`
    pub fn to_subject<S: Into<String>>(subject: S) -> Self {
        Self::new().with_send_subject(subject)
    }

    pub fn with_send_subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.send_subject = Some(subject.into());
        self
    }

    pub fn with_reply_subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.reply_subject = Some(subject.into());
        self
    }

    pub fn set_send_subject<S: Into<String>>(&mut self, subject: S) {
        self.send_subject = Some(subject.into());
    }

    pub fn set_reply_subject<S: Into<String>>(&mut self, subject: S) {
        self.reply_subject = Some(subject.into());
    }

    pub fn send_subject(&self) -> Option<&str> {
        self.send_subject.as_deref()
    }

    pub fn reply_subject(&self) -> Option<&str> {
        self.reply_subject.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Insert or replace a field, keeping the position of an existing one
    fn update(&mut self, name: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|field| field.name == name) {
            Some(field) => field.value = value,
            None => self.fields.push(Field {
                name: name.to_string(),
                value,
            }),
        }
    }

    fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }

    pub fn update_u32(&mut self, name: &str, value: u32) {
        self.update(name, FieldValue::U32(value));
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.get(name) {
            Some(FieldValue::U32(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn update_string<S: Into<String>>(&mut self, name: &str, value: S) {
        self.update(name, FieldValue::String(value.into()));
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FieldValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn update_message(&mut self, name: &str, value: Message) {
        self.update(name, FieldValue::Message(Box::new(value)));
    }

    pub fn get_message(&self, name: &str) -> Option<&Message> {
        match self.get(name) {
            Some(FieldValue::Message(value)) => Some(value.as_ref()),
            _ => None,
        }
    }

    /// Remove a nested message field and return it
    pub fn take_message(&mut self, name: &str) -> Option<Message> {
        let position = self
            .fields
            .iter()
            .position(|field| field.name == name && matches!(field.value, FieldValue::Message(_)))?;
        match self.fields.remove(position).value {
            FieldValue::Message(message) => Some(*message),
            _ => None,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (index, field) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            match &field.value {
                FieldValue::U32(value) => write!(f, "{}={}", field.name, value)?,
                FieldValue::String(value) => write!(f, "{}=\"{}\"", field.name, value)?,
                FieldValue::Message(value) => write!(f, "{}={}", field.name, value)?,
            }
        }
        write!(f, "}}")
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
