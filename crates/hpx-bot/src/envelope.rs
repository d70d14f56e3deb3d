//! Wire types exchanged with the real-time service.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BotResult;

/// Envelope `Type` that carries a chat message.
pub const MESSAGE_TYPE: &str = "message";

/// Outer `{Type, Message}` wrapper around every inbound payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload discriminator.
    #[serde(rename = "Type")]
    pub kind: String,
    /// Application payload.
    #[serde(rename = "Message", default)]
    pub message: Value,
}

impl Envelope {
    /// Create an envelope from its parts.
    pub fn new(kind: impl Into<String>, message: Value) -> Self {
        Self {
            kind: kind.into(),
            message,
        }
    }

    /// Decode an envelope from raw text.
    pub fn from_text(text: &str) -> BotResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns true if this envelope carries a chat message.
    pub fn is_chat_message(&self) -> bool {
        self.kind == MESSAGE_TYPE
    }

    /// `Message.Text`, if present.
    pub fn text(&self) -> Option<&str> {
        self.message.get("Text").and_then(Value::as_str)
    }

    /// Decode the payload as a [`ChatMessage`].
    pub fn chat_message(&self) -> BotResult<ChatMessage> {
        Ok(ChatMessage::deserialize(&self.message)?)
    }
}

/// A user of the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Numeric id.
    #[serde(rename = "Id", default)]
    pub id: i64,
    /// Public handle, without the leading `@`.
    #[serde(rename = "Tag", default)]
    pub tag: String,
    /// Display name.
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A chat message as delivered inside an [`Envelope`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id.
    #[serde(rename = "Id", default)]
    pub id: i64,
    /// Dialog the message belongs to.
    #[serde(rename = "DialogId", default)]
    pub dialog_id: i64,
    /// Message body.
    #[serde(rename = "Text", default)]
    pub text: String,
    /// Author.
    #[serde(rename = "Sender", default)]
    pub sender: User,
    /// Reposted message payload, if this message is a repost.
    #[serde(rename = "Repost", default, skip_serializing_if = "Option::is_none")]
    pub repost: Option<Value>,
}

impl ChatMessage {
    /// Id of the author, used as the cooldown key.
    pub fn user_id(&self) -> i64 {
        self.sender.id
    }
}

/// Subscription control verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    /// Start observing a thing.
    Subscribe,
    /// Stop observing a thing.
    Unsubscribe,
}

/// Outbound `{command, category, thing_id}` control message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Verb.
    pub command: ControlCommand,
    /// Subscription category.
    pub category: String,
    /// Id of the observed thing.
    pub thing_id: i64,
}

impl ControlMessage {
    /// Serialize to the JSON text sent on the wire.
    pub fn to_text(&self) -> BotResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
