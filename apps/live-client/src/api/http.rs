//! REST implementation of the collaborator traits over `reqwest`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ClientError;
use crate::models::membership::UserEvents;
use crate::models::message::{Message, SendMessageRequest};
use crate::models::notification::Notification;
use crate::models::participant::Participant;

use super::{AnnouncementService, ChatService, EventMembership, ParticipantRoster};

/// Collaborator client for the platform REST API, authenticated with the session token.
#[derive(Clone)]
pub struct HttpBackend {
    api_url: String,
    token: String,
    http: reqwest::Client,
}

/// List endpoints answer either a bare array or `{ "data": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Bare(Vec<T>),
    Wrapped { data: Vec<T> },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            ListBody::Bare(items) | ListBody::Wrapped { data: items } => items,
        }
    }
}

/// Error body shape used by the platform (`{ "error": { "code", "message" } }`).
#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

impl HttpBackend {
    pub fn new(api_url: &str, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ClientError> {
        let body: ListBody<T> = self.get_json(path).await?;
        Ok(body.into_vec())
    }
}

/// Turn a non-2xx response into `ClientError::http`, otherwise decode the JSON body.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.error.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status.to_string());
        return Err(ClientError::http(status.as_u16(), message));
    }
    Ok(resp.json::<T>().await?)
}

#[async_trait]
impl EventMembership for HttpBackend {
    async fn get_user_events(&self) -> Result<UserEvents, ClientError> {
        self.get_json("/api/users/me/events").await
    }
}

#[async_trait]
impl AnnouncementService for HttpBackend {
    async fn get_event_announcements(
        &self,
        event_id: &str,
    ) -> Result<Vec<Notification>, ClientError> {
        self.get_list(&format!("/api/events/{event_id}/announcements"))
            .await
    }

    async fn mark_as_read(&self, id: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/announcements/{id}/read")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::http(status.as_u16(), status.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatService for HttpBackend {
    async fn get_messages(
        &self,
        event_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ClientError> {
        self.get_list(&format!(
            "/api/events/{event_id}/messages?page={page}&limit={limit}"
        ))
        .await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/events/{}/messages", request.event_id)))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        decode(resp).await
    }
}

#[async_trait]
impl ParticipantRoster for HttpBackend {
    async fn get_participants(&self, event_id: &str) -> Result<Vec<Participant>, ClientError> {
        self.get_list(&format!("/api/events/{event_id}/participants"))
            .await
    }
}
