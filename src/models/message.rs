use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssign,
    TaskComplete,
    TaskProgress,
    TaskFailed,
    StatusUpdate,
    Question,
    Answer,
    Broadcast,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// A single IPC message. `receiver_id == None` marks a broadcast: the IPC
/// store fans it out to every registered agent directory except the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender_id: String,
        receiver_id: Option<String>,
        message_type: MessageType,
        priority: MessagePriority,
        subject: String,
        content: String,
        metadata: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            receiver_id,
            message_type,
            priority,
            subject,
            content,
            metadata,
            created_at: Utc::now(),
            read_at: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_none()
    }

    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_has_no_receiver() {
        let msg = Message::new(
            "admin".into(),
            None,
            MessageType::Broadcast,
            MessagePriority::Normal,
            "hello".into(),
            "body".into(),
            serde_json::Map::new(),
        );
        assert!(msg.is_broadcast());
        assert!(msg.is_unread());
    }
}
