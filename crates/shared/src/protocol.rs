use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{MessageId, ServerId, UserId},
    error::FrameError,
};

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A chat message as the backend stores and pushes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(rename = "message", default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Epoch milliseconds; some server-channel payloads only carry this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_stamp: Option<i64>,
}

impl ChatMessage {
    /// The time used to order a conversation: `createdAt`, then `timestamp`,
    /// then the numeric `timeStamp`.
    pub fn sort_time(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .or(self.timestamp)
            .or_else(|| self.time_stamp.and_then(DateTime::from_timestamp_millis))
    }

    pub fn has_temporary_id(&self) -> bool {
        self.id.as_ref().is_some_and(MessageId::is_temporary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSummary {
    #[serde(rename = "_id", alias = "id")]
    pub id: ServerId,
    #[serde(default)]
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerSummary>,
    #[serde(default)]
    pub friends: Vec<Friend>,
    #[serde(default)]
    pub friend_requests: Vec<Friend>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "_id", alias = "id")]
    pub id: ServerId,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub owners: Vec<Friend>,
    #[serde(default)]
    pub members: Vec<Friend>,
}

impl ServerInfo {
    pub fn is_owner(&self, email: &str) -> bool {
        self.owners.iter().any(|owner| owner.email == email)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonSearchResult {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default)]
    pub is_verified: bool,
    /// Already friends with the caller.
    #[serde(default)]
    pub friends: bool,
    /// A friend request is outstanding.
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendConfirmationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfoResponse {
    pub user: UserProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindPeopleResponse {
    #[serde(default)]
    pub result: Vec<PersonSearchResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerRequest {
    pub server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeopleRequest {
    pub server_id: ServerId,
    pub user_to_add_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteToAdminRequest {
    pub server_id: ServerId,
    pub user_to_promote_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPeopleRequest {
    pub server_id: ServerId,
    pub user_to_kick_id: UserId,
}

/// One realtime frame on the wire: `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Events the backend pushes to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    PrivateMessage(ChatMessage),
    ServerMessage(ChatMessage),
    FriendRequestReceived,
    AddedToServer,
    FriendsOnline(Vec<Friend>),
    FriendOnline(Friend),
    FriendOffline(Friend),
}

impl InboundEvent {
    pub const RECEIVE_PRIVATE_MESSAGE: &'static str = "receive-private-message";
    pub const RECEIVE_SERVER_MESSAGE: &'static str = "receive-server-message";
    pub const RECEIVE_FRIEND_REQUEST: &'static str = "receive-friend-request";
    pub const RECEIVE_ADD_TO_SERVER: &'static str = "receive-add-to-server";
    pub const SHOW_USER_FRIENDS_ONLINE: &'static str = "show-user-friends-online";
    pub const FRIEND_ONLINE: &'static str = "friend-online";
    pub const FRIEND_OFFLINE: &'static str = "friend-offline";

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PrivateMessage(_) => Self::RECEIVE_PRIVATE_MESSAGE,
            Self::ServerMessage(_) => Self::RECEIVE_SERVER_MESSAGE,
            Self::FriendRequestReceived => Self::RECEIVE_FRIEND_REQUEST,
            Self::AddedToServer => Self::RECEIVE_ADD_TO_SERVER,
            Self::FriendsOnline(_) => Self::SHOW_USER_FRIENDS_ONLINE,
            Self::FriendOnline(_) => Self::FRIEND_ONLINE,
            Self::FriendOffline(_) => Self::FRIEND_OFFLINE,
        }
    }

    /// Decodes a text frame. Notification events ignore their payload.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let frame: RealtimeFrame = serde_json::from_str(text)?;
        let data = frame.data;
        let event = match frame.event.as_str() {
            Self::RECEIVE_PRIVATE_MESSAGE => Self::PrivateMessage(serde_json::from_value(data)?),
            Self::RECEIVE_SERVER_MESSAGE => Self::ServerMessage(serde_json::from_value(data)?),
            Self::RECEIVE_FRIEND_REQUEST => Self::FriendRequestReceived,
            Self::RECEIVE_ADD_TO_SERVER => Self::AddedToServer,
            Self::SHOW_USER_FRIENDS_ONLINE => Self::FriendsOnline(serde_json::from_value(data)?),
            Self::FRIEND_ONLINE => Self::FriendOnline(serde_json::from_value(data)?),
            Self::FRIEND_OFFLINE => Self::FriendOffline(serde_json::from_value(data)?),
            _ => return Err(FrameError::UnknownEvent(frame.event)),
        };
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            Self::PrivateMessage(message) | Self::ServerMessage(message) => {
                serde_json::to_value(message)?
            }
            Self::FriendRequestReceived | Self::AddedToServer => serde_json::Value::Null,
            Self::FriendsOnline(friends) => serde_json::to_value(friends)?,
            Self::FriendOnline(friend) | Self::FriendOffline(friend) => {
                serde_json::to_value(friend)?
            }
        };
        serde_json::to_string(&RealtimeFrame {
            event: self.event_name().to_string(),
            data,
        })
    }
}

/// Events the client emits to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    /// Presence registration; the backend answers with `show-user-friends-online`.
    SetUser(UserProfile),
    #[serde(rename_all = "camelCase")]
    SendPrivateMessage {
        message: ChatMessage,
        receiver_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    SendServerMessage {
        server_id: ServerId,
        message: ChatMessage,
    },
    #[serde(rename_all = "camelCase")]
    SendFriendRequest { to_user_id: UserId },
    #[serde(rename_all = "camelCase")]
    AddPeopleToServer { to_user_id: UserId },
}

impl OutboundEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SetUser(_) => "set-user",
            Self::SendPrivateMessage { .. } => "send-private-message",
            Self::SendServerMessage { .. } => "send-server-message",
            Self::SendFriendRequest { .. } => "send-friend-request",
            Self::AddPeopleToServer { .. } => "add-people-to-server",
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
