use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use shared::protocol::{
    AccessTokenResponse, MessageResponse, ResendConfirmationResponse, SignInRequest,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::{
    config::Settings,
    error::{ClientError, ClientResult},
    events::{ClientEvent, Notice, Route, SessionEvent, SignOutReason},
    gateway::CredentialSource,
    token_store::{Credential, TokenStore},
};

/// Drives sign-in, credential renewal and sign-out.
pub struct SessionFlow {
    http: Client,
    settings: Settings,
    tokens: TokenStore,
    route: RwLock<Route>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionFlow {
    pub fn new(settings: Settings, http: Client, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            http,
            settings,
            tokens: TokenStore::new(),
            route: RwLock::new(Route::SignIn),
            events,
        }
    }

    pub async fn route(&self) -> Route {
        *self.route.read().await
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.tokens.current().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.is_present().await
    }

    pub async fn login(&self, email: &str, password: &str) -> ClientResult<()> {
        let result = async {
            let response = self
                .http
                .post(self.settings.endpoint("/signin"))
                .json(&SignInRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                })
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ClientError::from_rejected_response(response).await);
            }
            let body: AccessTokenResponse = response.json().await?;
            Ok::<_, ClientError>(Credential::new(body.access_token))
        }
        .await;

        match result {
            Ok(credential) => {
                self.tokens.replace(credential).await;
                *self.route.write().await = Route::Protected;
                info!("session: signed in");
                self.publish(ClientEvent::Session(SessionEvent::SignedIn));
                Ok(())
            }
            Err(err) => {
                warn!("session: login failed: {err}");
                self.publish(ClientEvent::Notice(Notice::error(err.user_message())));
                Err(err)
            }
        }
    }

    /// Requests a fresh credential using the ambient renewal cookie. Any failure
    /// ends the session.
    pub async fn refresh(&self) -> ClientResult<Credential> {
        let result = async {
            let response = self
                .http
                .post(self.settings.endpoint("/refresh_token"))
                .json(&json!({}))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ClientError::from_rejected_response(response).await);
            }
            let body: AccessTokenResponse = response.json().await?;
            Ok::<_, ClientError>(Credential::new(body.access_token))
        }
        .await;

        match result {
            Ok(credential) => {
                self.tokens.replace(credential.clone()).await;
                info!("session: access credential refreshed");
                self.publish(ClientEvent::Session(SessionEvent::CredentialRefreshed));
                Ok(credential)
            }
            Err(err) => {
                warn!("session: failed to refresh access credential: {err}");
                self.end_session(SignOutReason::RefreshFailed).await;
                Err(ClientError::SessionExpired)
            }
        }
    }

    /// Clears local state first, then tells the backend. Never fails.
    pub async fn logout(&self) {
        self.end_session(SignOutReason::LoggedOut).await;

        let result = async {
            let response = self
                .http
                .post(self.settings.endpoint("/logout"))
                .json(&json!({}))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ClientError::from_rejected_response(response).await);
            }
            Ok::<_, ClientError>(response.json::<MessageResponse>().await.unwrap_or_default())
        }
        .await;

        match result {
            Ok(body) => {
                let message = body.message.unwrap_or_else(|| "Logged out".to_string());
                self.publish(ClientEvent::Notice(Notice::success(message)));
            }
            Err(err) => {
                warn!("session: logout notification failed: {err}");
                self.publish(ClientEvent::Notice(Notice::error(err.user_message())));
            }
        }
    }

    /// Asks the backend to re-send the account confirmation mail. Returns the
    /// page the backend wants the user sent to, if any.
    pub async fn resend_confirmation(
        &self,
        email: &str,
        password: &str,
    ) -> ClientResult<Option<String>> {
        let response = self
            .http
            .post(self.settings.endpoint("/resend_confirmation"))
            .json(&SignInRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await
            .inspect_err(|_| {
                self.publish(ClientEvent::Notice(Notice::error(
                    "Server error. Please try again later.",
                )));
            })?;

        if !response.status().is_success() {
            let err = ClientError::from_rejected_response(response).await;
            self.publish(ClientEvent::Notice(Notice::error(err.user_message())));
            return Err(err);
        }

        let body: ResendConfirmationResponse = response.json().await?;
        if let Some(message) = body.message {
            self.publish(ClientEvent::Notice(Notice::info(message)));
        }
        Ok(body.redirect_url)
    }

    async fn end_session(&self, reason: SignOutReason) {
        self.tokens.clear().await;
        *self.route.write().await = Route::SignIn;
        info!(?reason, "session: signed out");
        self.publish(ClientEvent::Session(SessionEvent::SignedOut { reason }));
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl CredentialSource for SessionFlow {
    async fn current_credential(&self) -> Option<Credential> {
        self.tokens.current().await
    }

    async fn refresh(&self) -> ClientResult<Credential> {
        SessionFlow::refresh(self).await
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
