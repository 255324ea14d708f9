use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use shared::{
    domain::{ConversationKey, ServerId, UserId},
    error::DEFAULT_ERROR_MESSAGE,
    protocol::{
        InboundEvent, MessageResponse, OutboundEvent, PersonSearchResult, ServerInfo,
        ServerResponse, UserProfile,
    },
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    conversation::ConversationView,
    error::{ClientError, ClientResult},
    events::{ClientEvent, Notice, PresenceSnapshot, SessionEvent},
    gateway::Gateway,
    presence::PresenceTracker,
    realtime::{RealtimeChannel, RealtimeEvent},
    session::SessionFlow,
};

pub const FRIEND_REQUEST_NOTICE: &str = "Someone sent you a friend request! Check your notification";
pub const ADDED_TO_SERVER_NOTICE: &str = "Someone added you to server";

/// Front-end facing client. Owns the session, gateway and realtime channel and
/// keeps them in step through a supervisor task.
pub struct ChatClient {
    settings: Settings,
    events: broadcast::Sender<ClientEvent>,
    session: Arc<SessionFlow>,
    gateway: Gateway,
    realtime: Arc<RealtimeChannel>,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    profile: Option<UserProfile>,
    presence: PresenceTracker,
    supervisor: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub fn new(settings: Settings) -> ClientResult<Arc<Self>> {
        // The renewal credential travels as a cookie set by the backend.
        let http = Client::builder().cookie_store(true).build()?;
        let (events, _) = broadcast::channel(1024);
        let session = Arc::new(SessionFlow::new(
            settings.clone(),
            http.clone(),
            events.clone(),
        ));
        let gateway = Gateway::new(settings.clone(), http, session.clone());
        let realtime = RealtimeChannel::new(settings.clone());
        Ok(Self::with_services(settings, events, session, gateway, realtime))
    }

    pub fn with_services(
        settings: Settings,
        events: broadcast::Sender<ClientEvent>,
        session: Arc<SessionFlow>,
        gateway: Gateway,
        realtime: Arc<RealtimeChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            events,
            session,
            gateway,
            realtime,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionFlow {
        &self.session
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    /// Spawns the supervisor. A credential held at this point is put to use
    /// immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.supervisor.is_some() {
            return;
        }

        // Subscribe before spawning so nothing published after `start` returns
        // is missed.
        let mut bus = self.events.subscribe();
        let mut realtime_events = self.realtime.subscribe();
        let client = Arc::clone(self);
        state.supervisor = Some(tokio::spawn(async move {
            if client.session.is_authenticated().await {
                client.establish().await;
            }
            loop {
                tokio::select! {
                    event = bus.recv() => match event {
                        Ok(ClientEvent::Session(session_event)) => {
                            client.on_session_event(session_event).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client: supervisor lagged behind event bus");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = realtime_events.recv() => match event {
                        Ok(event) => client.on_realtime_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client: supervisor lagged behind realtime events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));
        info!("client: supervisor started");
    }

    pub async fn shutdown(&self) {
        let (supervisor, reconnect) = {
            let mut state = self.state.lock().await;
            (state.supervisor.take(), state.reconnect.take())
        };
        if let Some(handle) = reconnect {
            handle.abort();
        }
        if let Some(handle) = supervisor {
            handle.abort();
        }
        self.realtime.disconnect().await;
        info!("client: shut down");
    }

    pub async fn login(&self, email: &str, password: &str) -> ClientResult<()> {
        self.session.login(email, password).await
    }

    pub async fn logout(&self) {
        self.session.logout().await
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        self.state.lock().await.profile.clone()
    }

    pub async fn presence(&self) -> PresenceSnapshot {
        self.state.lock().await.presence.snapshot()
    }

    pub async fn refresh_profile(&self) -> ClientResult<UserProfile> {
        let profile = self.gateway.fetch_user().await?;
        self.set_profile(profile.clone()).await;
        Ok(profile)
    }

    pub async fn search_people(&self, name: &str) -> ClientResult<Vec<PersonSearchResult>> {
        self.gateway.search_people(name).await
    }

    /// REST request first; the realtime nudge to the receiver is best-effort.
    pub async fn send_friend_request(&self, receiver: &UserId) -> ClientResult<MessageResponse> {
        let result = self.gateway.send_friend_request(receiver).await;
        self.notify_outcome(&result, |body| body.message.clone(), None, None);
        let body = result?;
        self.emit_best_effort(&OutboundEvent::SendFriendRequest {
            to_user_id: receiver.clone(),
        })
        .await;
        Ok(body)
    }

    pub async fn accept_friend_request(&self, requester: &UserId) -> ClientResult<MessageResponse> {
        let result = self.gateway.accept_friend_request(requester).await;
        self.notify_outcome(
            &result,
            |body| body.message.clone(),
            None,
            Some("Failed to accept friend request"),
        );
        let body = result?;
        self.refresh_profile_best_effort().await;
        Ok(body)
    }

    pub async fn create_server(&self, server_name: &str) -> ClientResult<ServerResponse> {
        let result = self.gateway.create_server(server_name).await;
        self.notify_outcome(
            &result,
            |body| body.message.clone(),
            None,
            Some("Failed to create server"),
        );
        let body = result?;
        self.refresh_profile_best_effort().await;
        Ok(body)
    }

    pub async fn get_server_info(&self, server_id: &ServerId) -> ClientResult<ServerInfo> {
        self.gateway.get_server_info(server_id).await.inspect_err(|err| {
            self.publish(ClientEvent::Notice(Notice::error(failure_text(
                err,
                "Failed to fetch server info",
            ))));
        })
    }

    pub async fn add_people_to_server(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let result = self.gateway.add_people(server_id, user_id).await;
        self.notify_outcome(
            &result,
            |body| body.message.clone(),
            Some("User successfully added!"),
            Some("Failed to add user"),
        );
        let body = result?;
        self.emit_best_effort(&OutboundEvent::AddPeopleToServer {
            to_user_id: user_id.clone(),
        })
        .await;
        Ok(body)
    }

    pub async fn promote_to_admin(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let result = self.gateway.promote_to_admin(server_id, user_id).await;
        self.notify_outcome(
            &result,
            |body| body.message.clone(),
            Some("User successfully promoted to admin!"),
            Some("Failed to promote user"),
        );
        result
    }

    pub async fn kick_people(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let result = self.gateway.kick_people(server_id, user_id).await;
        self.notify_outcome(
            &result,
            |body| body.message.clone(),
            Some("User successfully kicked!"),
            Some("Failed to kick user"),
        );
        result
    }

    /// Opens a view on `key` for the signed-in user. History is not loaded
    /// until the caller asks for it.
    pub async fn open_conversation(&self, key: ConversationKey) -> ClientResult<ConversationView> {
        let profile = self.profile().await.ok_or(ClientError::NotSignedIn)?;
        let my_name = profile.display_name().to_string();
        Ok(ConversationView::new(
            key,
            profile.id,
            my_name,
            self.gateway.clone(),
            Arc::clone(&self.realtime),
        ))
    }

    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::SignedIn | SessionEvent::CredentialRefreshed => self.establish().await,
            SessionEvent::SignedOut { reason } => {
                info!(?reason, "client: tearing down signed-in state");
                let reconnect = {
                    let mut state = self.state.lock().await;
                    state.profile = None;
                    state.presence.clear();
                    state.reconnect.take()
                };
                if let Some(handle) = reconnect {
                    handle.abort();
                }
                self.realtime.disconnect().await;
                self.publish(ClientEvent::PresenceChanged(PresenceSnapshot::default()));
            }
        }
    }

    /// Binds the realtime channel to the current credential, then loads the
    /// profile. Presence is registered once a profile is known.
    async fn establish(self: &Arc<Self>) {
        let Some(credential) = self.session.credential().await else {
            return;
        };
        if !self.realtime.is_connected_with(&credential).await {
            if let Err(err) = self.realtime.connect(&credential).await {
                warn!("client: realtime connect failed: {err}");
                self.publish(ClientEvent::Error(err.user_message()));
                self.schedule_reconnect().await;
            }
        }

        // On success `set_profile` registers presence.
        if let Err(err) = self.refresh_profile().await {
            warn!("client: failed to load user profile: {err}");
            self.publish(ClientEvent::Error(err.user_message()));
            if let Some(profile) = self.profile().await {
                self.register_presence(profile).await;
            }
        }
    }

    async fn register_presence(&self, profile: UserProfile) {
        if let Err(err) = self.realtime.emit(&OutboundEvent::SetUser(profile)).await {
            warn!("client: presence registration failed: {err}");
        }
    }

    async fn on_realtime_event(self: &Arc<Self>, event: RealtimeEvent) {
        match event {
            RealtimeEvent::Connected => self.publish(ClientEvent::RealtimeConnected),
            RealtimeEvent::Disconnected { expected } => {
                self.state.lock().await.presence.clear();
                self.publish(ClientEvent::PresenceChanged(PresenceSnapshot::default()));
                self.publish(ClientEvent::RealtimeDisconnected);
                if !expected {
                    self.schedule_reconnect().await;
                }
            }
            RealtimeEvent::Inbound(event) => self.route_inbound(event).await,
        }
    }

    async fn route_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::PrivateMessage(message) => {
                self.publish(ClientEvent::PrivateMessage(message))
            }
            InboundEvent::ServerMessage(message) => self.publish(ClientEvent::ServerMessage(message)),
            InboundEvent::FriendRequestReceived => {
                self.publish(ClientEvent::Notice(Notice::success(FRIEND_REQUEST_NOTICE)));
                self.refresh_profile_best_effort().await;
            }
            InboundEvent::AddedToServer => {
                self.publish(ClientEvent::Notice(Notice::success(ADDED_TO_SERVER_NOTICE)));
                self.refresh_profile_best_effort().await;
            }
            InboundEvent::FriendsOnline(online) => {
                let snapshot = {
                    let mut state = self.state.lock().await;
                    let friends = state
                        .profile
                        .as_ref()
                        .map(|profile| profile.friends.clone())
                        .unwrap_or_default();
                    state.presence.apply_snapshot(&friends, online);
                    state.presence.snapshot()
                };
                debug!(online = snapshot.online.len(), "client: presence snapshot applied");
                self.publish(ClientEvent::PresenceChanged(snapshot));
            }
            InboundEvent::FriendOnline(friend) => {
                let snapshot = {
                    let mut state = self.state.lock().await;
                    state
                        .presence
                        .friend_online(friend)
                        .then(|| state.presence.snapshot())
                };
                if let Some(snapshot) = snapshot {
                    self.publish(ClientEvent::PresenceChanged(snapshot));
                }
            }
            InboundEvent::FriendOffline(friend) => {
                let snapshot = {
                    let mut state = self.state.lock().await;
                    state
                        .presence
                        .friend_offline(friend)
                        .then(|| state.presence.snapshot())
                };
                if let Some(snapshot) = snapshot {
                    self.publish(ClientEvent::PresenceChanged(snapshot));
                }
            }
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        if self.settings.reconnect_attempts == 0 || !self.session.is_authenticated().await {
            return;
        }
        let mut state = self.state.lock().await;
        if state
            .reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        let client = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            client.reconnect_with_backoff().await;
        }));
    }

    async fn reconnect_with_backoff(&self) {
        let strategy = ExponentialBuilder::default()
            .with_min_delay(self.settings.reconnect_min_delay())
            .with_max_delay(self.settings.reconnect_max_delay())
            .with_max_times(self.settings.reconnect_attempts);

        let result = (|| async {
            let credential = self
                .session
                .credential()
                .await
                .ok_or(ClientError::NotSignedIn)?;
            self.realtime.connect(&credential).await?;
            Ok::<(), ClientError>(())
        })
        .retry(strategy)
        .when(|err| !matches!(err, ClientError::NotSignedIn))
        .notify(|err, delay| {
            warn!(?delay, "client: realtime reconnect failed, retrying: {err}");
        })
        .await;

        match result {
            Ok(()) => {
                info!("client: realtime reconnected");
                if let Some(profile) = self.profile().await {
                    self.register_presence(profile).await;
                }
            }
            Err(err) => {
                warn!("client: giving up on realtime reconnect: {err}");
                self.publish(ClientEvent::Notice(Notice::error(
                    "Lost connection to the chat server",
                )));
            }
        }
    }

    async fn set_profile(&self, profile: UserProfile) {
        self.state.lock().await.profile = Some(profile.clone());
        self.publish(ClientEvent::ProfileUpdated(profile.clone()));
        if self.realtime.is_connected().await {
            self.register_presence(profile).await;
        }
    }

    async fn refresh_profile_best_effort(&self) {
        if let Err(err) = self.refresh_profile().await {
            warn!("client: profile refresh failed: {err}");
        }
    }

    async fn emit_best_effort(&self, event: &OutboundEvent) {
        if let Err(err) = self.realtime.emit(event).await {
            warn!(event = event.event_name(), "client: realtime emit skipped: {err}");
        }
    }

    /// Publishes the success or failure notice for a REST helper. The
    /// backend's own message wins over the fallbacks.
    fn notify_outcome<T>(
        &self,
        result: &ClientResult<T>,
        success_message: impl Fn(&T) -> Option<String>,
        success_fallback: Option<&str>,
        failure_fallback: Option<&str>,
    ) {
        let notice = match result {
            Ok(body) => success_message(body)
                .or_else(|| success_fallback.map(str::to_string))
                .map(Notice::success),
            Err(err) => Some(Notice::error(match failure_fallback {
                Some(fallback) => failure_text(err, fallback),
                None => err.user_message(),
            })),
        };
        if let Some(notice) = notice {
            self.publish(ClientEvent::Notice(notice));
        }
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// The backend's message for a rejection, otherwise `fallback`.
fn failure_text(err: &ClientError, fallback: &str) -> String {
    match err {
        ClientError::Rejected { message, .. } if message != DEFAULT_ERROR_MESSAGE => {
            message.clone()
        }
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
