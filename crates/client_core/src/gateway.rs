use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::{
    config::Settings,
    error::{ClientError, ClientResult},
    token_store::Credential,
};

/// Where the gateway gets bearer credentials from. `SessionFlow` is the real
/// implementation; tests substitute fakes.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn current_credential(&self) -> Option<Credential>;
    async fn refresh(&self) -> ClientResult<Credential>;
}

/// Applies the bearer credential to every backend call and performs the single
/// refresh-and-replay on a 401.
#[derive(Clone)]
pub struct Gateway {
    http: Client,
    settings: Settings,
    credentials: Arc<dyn CredentialSource>,
}

impl Gateway {
    pub fn new(settings: Settings, http: Client, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            http,
            settings,
            credentials,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Issues the request built by `build`, decoding a JSON body on success.
    ///
    /// `build` may run twice: once with the current credential and once more
    /// after a refresh if the first attempt was rejected with 401.
    pub async fn execute<T, F>(&self, build: F) -> ClientResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client, &Settings) -> RequestBuilder,
    {
        let response = self.send_authorized(&build).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_authorized<F>(&self, build: &F) -> ClientResult<Response>
    where
        F: Fn(&Client, &Settings) -> RequestBuilder,
    {
        let credential = match self.credentials.current_credential().await {
            Some(credential) => credential,
            None => {
                debug!("gateway: no credential held; refreshing before request");
                self.credentials.refresh().await?
            }
        };

        let response = build(&self.http, &self.settings)
            .bearer_auth(credential.expose())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(response).await;
        }

        info!("gateway: request unauthorized; refreshing credential and retrying once");
        let credential = self.credentials.refresh().await?;
        let response = build(&self.http, &self.settings)
            .bearer_auth(credential.expose())
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        ensure_success(response).await
    }
}

async fn ensure_success(response: Response) -> ClientResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ClientError::from_rejected_response(response).await)
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
