//! Entity types stored in SQLite.
//!
//! Enum variants round-trip through TEXT columns via `as_str` /
//! `TryFrom<&str>`; unknown stored values surface as conversion errors
//! rather than silently defaulting.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub telegram_user_id: i64,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BotRecord {
    pub id: Uuid,
    /// AEAD ciphertext of the credential; plaintext is never stored.
    pub token: String,
    pub name: String,
    pub manager_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecipientKind {
    User,
    Group,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::User => "user",
            RecipientKind::Group => "group",
        }
    }
}

impl TryFrom<&str> for RecipientKind {
    type Error = StoreError;

    fn try_from(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "user" => Ok(RecipientKind::User),
            "group" => Ok(RecipientKind::Group),
            other => Err(StoreError::Conflict(format!(
                "unknown recipient kind: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Recipient {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub kind: RecipientKind,
    pub chat_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Guest {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub guest_user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Ban,
    Unban,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Ban => "ban",
            RequestKind::Unban => "unban",
        }
    }
}

impl TryFrom<&str> for RequestKind {
    type Error = StoreError;

    fn try_from(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "ban" => Ok(RequestKind::Ban),
            "unban" => Ok(RequestKind::Unban),
            other => Err(StoreError::Conflict(format!("unknown request kind: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }
}

impl TryFrom<&str> for RequestStatus {
    type Error = StoreError;

    fn try_from(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            other => Err(StoreError::Conflict(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub guest_id: Uuid,
    pub request_kind: RequestKind,
    pub status: RequestStatus,
    pub request_user_id: Uuid,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalMessage {
    pub id: Uuid,
    pub blacklist_id: Uuid,
    pub user_id: Uuid,
    pub chat_id: i64,
    pub message_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl TryFrom<&str> for Direction {
    type Error = StoreError;

    fn try_from(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(StoreError::Conflict(format!("unknown direction: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageMapping {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub guest_chat_id: i64,
    pub guest_message_id: i64,
    pub recipient_chat_id: i64,
    pub recipient_message_id: i64,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BotAdmin {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub admin_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditAction {
    AddBot,
    DeleteBot,
    Ban,
    Unban,
    AddAdmin,
    DelAdmin,
    AddRecipient,
    DelRecipient,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AddBot => "add_bot",
            AuditAction::DeleteBot => "delete_bot",
            AuditAction::Ban => "ban",
            AuditAction::Unban => "unban",
            AuditAction::AddAdmin => "add_admin",
            AuditAction::DelAdmin => "del_admin",
            AuditAction::AddRecipient => "add_recipient",
            AuditAction::DelRecipient => "del_recipient",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
