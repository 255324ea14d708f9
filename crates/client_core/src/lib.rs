//! Client-side core for the chat service: session and credential handling,
//! authenticated REST calls, the realtime push channel, message reconciliation
//! and friend presence. Front-ends drive a [`ChatClient`] and render the
//! [`ClientEvent`]s it publishes.

pub mod api;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod presence;
pub mod realtime;
pub mod reconciliation;
pub mod session;
pub mod token_store;

pub use client::ChatClient;
pub use config::{load_settings, Settings};
pub use conversation::{ConversationView, PageRequest};
pub use error::{ClientError, ClientResult, ErrorCategory};
pub use events::{ClientEvent, Notice, NoticeLevel, PresenceSnapshot, Route, SessionEvent};
pub use gateway::{CredentialSource, Gateway};
pub use realtime::{RealtimeChannel, RealtimeEvent};
pub use reconciliation::{ConversationLog, PaginationCursor, PushOutcome, HISTORY_PAGE_SIZE};
pub use session::SessionFlow;
pub use token_store::Credential;
