use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery lifecycle of an outgoing message.
///
/// `Sending` is the optimistic local state, `Sent` means the transport
/// accepted the frame, `Delivered`/`Read` are server-confirmed terminal
/// states, and `Failed` is the terminal state after the durable fallback
/// also failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 4,
        }
    }

    /// Terminal statuses are never overwritten by later confirmations.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Read | DeliveryStatus::Failed
        )
    }

    /// Whether a status transition from `self` to `next` is a forward move.
    ///
    /// `Read` and `Failed` are sticky: a late `delivered` confirmation for a
    /// message that already failed over to the durable path (or was read)
    /// must be a no-op, never a downgrade or a resurrection.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        if self == DeliveryStatus::Read || self == DeliveryStatus::Failed {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// Role a participant plays in a conversation; determines which unread tab
/// the conversation counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Host,
    Tenant,
}

/// Opaque reference to an already-uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub key: Option<String>,
    pub mime_type: Option<String>,
}

/// A single conversation message.
///
/// `client_id` is the caller-generated, permanent identity used for
/// de-duplication and acknowledgment correlation; `id` is the server-assigned
/// identity and exists only once the message has been persisted somewhere.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Option<String>,
    pub client_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_status: DeliveryStatus,
    /// Local read flag, distinct from `delivery_status`.
    pub is_read: bool,
    /// True while the message is optimistic and unconfirmed.
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub role: Role,
}

/// A conversation as held by the state store: a fixed participant set and an
/// insertion-ordered message sequence.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<Participant>,
    pub messages: Vec<Message>,
    pub is_unread: bool,
}

impl Conversation {
    /// The single counterpart of `user_id` in a 1:1 conversation.
    pub fn other_participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.role)
    }
}

/// The authenticated user, as handed over by the identity collaborator.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub display_name: String,
    pub image_url: Option<String>,
    pub role: Role,
}

/// Ephemeral typing state for one `(conversation, sender)` pair. Never
/// persisted; expires via a local timer independent of the sender.
#[derive(Debug, Clone)]
pub struct TypingState {
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}
