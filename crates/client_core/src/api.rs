//! Backend REST operations. Every call goes through [`Gateway::execute`].

use shared::{
    domain::{ConversationKey, ServerId, UserId},
    protocol::{
        AddPeopleRequest, ChatMessage, CreateServerRequest, FindPeopleResponse,
        KickPeopleRequest, MessageResponse, PersonSearchResult, PromoteToAdminRequest,
        ServerInfo, ServerResponse, UserInfoResponse, UserProfile,
    },
};

use crate::{
    error::{ClientError, ClientResult},
    gateway::Gateway,
    reconciliation::HISTORY_PAGE_SIZE,
};

impl Gateway {
    pub async fn fetch_user(&self) -> ClientResult<UserProfile> {
        let body: UserInfoResponse = self
            .execute(|http, settings| http.get(settings.endpoint("/get_user_info")))
            .await?;
        Ok(body.user)
    }

    pub async fn search_people(&self, search_name: &str) -> ClientResult<Vec<PersonSearchResult>> {
        let body: FindPeopleResponse = self
            .execute(|http, settings| {
                http.get(settings.endpoint("/find_people"))
                    .query(&[("search_name", search_name)])
            })
            .await?;
        Ok(body.result)
    }

    pub async fn send_friend_request(&self, receiver: &UserId) -> ClientResult<MessageResponse> {
        self.execute(|http, settings| {
            http.post(settings.endpoint(&format!("/send_friend_request/{receiver}")))
        })
        .await
    }

    pub async fn accept_friend_request(&self, requester: &UserId) -> ClientResult<MessageResponse> {
        self.execute(|http, settings| {
            http.post(settings.endpoint(&format!("/accept_friend_request/{requester}")))
        })
        .await
    }

    pub async fn create_server(&self, server_name: &str) -> ClientResult<ServerResponse> {
        let request = CreateServerRequest {
            server_name: server_name.to_string(),
        };
        self.execute(|http, settings| {
            http.post(settings.endpoint("/create_new_server"))
                .json(&request)
        })
        .await
    }

    pub async fn get_server_info(&self, server_id: &ServerId) -> ClientResult<ServerInfo> {
        let body: ServerResponse = self
            .execute(|http, settings| {
                http.get(settings.endpoint("/get_server_info"))
                    .query(&[("serverId", server_id.as_str())])
            })
            .await?;
        body.server.ok_or_else(|| missing_server(server_id))
    }

    pub async fn add_people(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let request = AddPeopleRequest {
            server_id: server_id.clone(),
            user_to_add_id: user_id.clone(),
        };
        self.execute(|http, settings| http.put(settings.endpoint("/add_people")).json(&request))
            .await
    }

    pub async fn promote_to_admin(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let request = PromoteToAdminRequest {
            server_id: server_id.clone(),
            user_to_promote_id: user_id.clone(),
        };
        self.execute(|http, settings| {
            http.put(settings.endpoint("/promote_to_admin"))
                .json(&request)
        })
        .await
    }

    pub async fn kick_people(
        &self,
        server_id: &ServerId,
        user_id: &UserId,
    ) -> ClientResult<ServerResponse> {
        let request = KickPeopleRequest {
            server_id: server_id.clone(),
            user_to_kick_id: user_id.clone(),
        };
        self.execute(|http, settings| http.put(settings.endpoint("/kick_people")).json(&request))
            .await
    }

    /// One 1-based page of history. Item order within the page is not relied
    /// on; the log re-sorts on merge.
    pub async fn fetch_history(
        &self,
        key: &ConversationKey,
        page: u32,
    ) -> ClientResult<Vec<ChatMessage>> {
        let (path, id_param, id) = match key {
            ConversationKey::Direct { peer } => {
                ("/messages/private/get_message", "otherUserId", peer.as_str())
            }
            ConversationKey::Server { server_id } => {
                ("/messages/server/get_message", "serverId", server_id.as_str())
            }
        };
        let query = [
            (id_param, id.to_string()),
            ("limit", HISTORY_PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        self.execute(|http, settings| http.get(settings.endpoint(path)).query(&query))
            .await
    }
}

fn missing_server(server_id: &ServerId) -> ClientError {
    ClientError::Rejected {
        status: reqwest::StatusCode::NOT_FOUND,
        message: format!("server {server_id} not found"),
    }
}
