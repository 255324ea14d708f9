//! Events published on the client event bus for front-ends to render.

use shared::protocol::{ChatMessage, Friend, UserProfile};

/// Which area the front-end should present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SignIn,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    LoggedOut,
    RefreshFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    CredentialRefreshed,
    SignedOut { reason: SignOutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// A transient user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresenceSnapshot {
    pub online: Vec<Friend>,
    pub offline: Vec<Friend>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Session(SessionEvent),
    Notice(Notice),
    RealtimeConnected,
    RealtimeDisconnected,
    PrivateMessage(ChatMessage),
    ServerMessage(ChatMessage),
    PresenceChanged(PresenceSnapshot),
    ProfileUpdated(UserProfile),
    Error(String),
}
