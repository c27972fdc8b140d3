use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use civic_types::api::{
    ApiResponse, ConsentRequest, ConsentResponse, CreateIssueRequest, LoginRequest, LoginResponse,
    MergeIssueRequest, Pagination, PermissionsResponse, RegisterRequest, RegisterResponse,
    SendChatRequest,
};
use civic_types::models::{ChatMessage, Issue, Role};

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Typed wrapper over the REST surface. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    // -- Auth --

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        role: Option<Role>,
        government_code: Option<&str>,
    ) -> Result<RegisterResponse, ClientError> {
        let body = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
            role,
            government_code: government_code.map(str::to_string),
        };
        self.send(self.request(Method::POST, "/auth/register").json(&body)).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.send(self.request(Method::POST, "/auth/login").json(&body)).await
    }

    // -- Issues --

    pub async fn create_issue(&self, title: &str, description: &str) -> Result<Issue, ClientError> {
        let body = CreateIssueRequest {
            title: title.to_string(),
            description: description.to_string(),
        };
        self.post_json("/issues", &body).await
    }

    pub async fn get_issue(&self, issue_id: Uuid) -> Result<Issue, ClientError> {
        self.get_json(&format!("/issues/{}", issue_id)).await
    }

    pub async fn merge_issue(&self, issue_id: Uuid, canonical_issue_id: Uuid) -> Result<Issue, ClientError> {
        self.post_json(
            &format!("/issues/{}/merge", issue_id),
            &MergeIssueRequest { canonical_issue_id },
        )
        .await
    }

    // -- Consent --

    pub async fn consent_status(&self, issue_id: Uuid) -> Result<ConsentResponse, ClientError> {
        self.get_json(&format!("/issues/{}/consent", issue_id)).await
    }

    pub async fn respond_to_consent(&self, issue_id: Uuid, accept: bool) -> Result<ConsentResponse, ClientError> {
        self.post_json(&format!("/issues/{}/consent", issue_id), &ConsentRequest { accept })
            .await
    }

    pub async fn pending_consents(&self) -> Result<Vec<Uuid>, ClientError> {
        self.get_json("/consent/pending").await
    }

    // -- Chat --

    pub async fn send_message(&self, issue_id: Uuid, message: &str) -> Result<ChatMessage, ClientError> {
        self.post_json(
            &format!("/issues/{}/chat", issue_id),
            &SendChatRequest { message: message.to_string() },
        )
        .await
    }

    /// One page of history; page 1 is the newest.
    pub async fn get_messages(
        &self,
        issue_id: Uuid,
        page: u32,
        page_size: Option<u32>,
    ) -> Result<(Vec<ChatMessage>, Pagination), ClientError> {
        let mut req = self
            .authed(Method::GET, &format!("/issues/{}/chat", issue_id))?
            .query(&[("page", page)]);
        if let Some(size) = page_size {
            req = req.query(&[("pageSize", size)]);
        }

        let envelope: ApiResponse<Vec<ChatMessage>> = decode(req.send().await?).await?;
        let pagination = envelope.pagination.ok_or(ClientError::EmptyResponse)?;
        let messages = envelope.data.ok_or(ClientError::EmptyResponse)?;
        Ok((messages, pagination))
    }

    pub async fn permissions(&self, issue_id: Uuid) -> Result<PermissionsResponse, ClientError> {
        self.get_json(&format!("/issues/{}/permissions", issue_id)).await
    }

    // -- Plumbing --

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{}", self.base_url, path))
    }

    fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let token = self.token.as_deref().ok_or(ClientError::NotAuthenticated)?;
        Ok(self.request(method, path).bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(self.authed(Method::GET, path)?).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        self.send(self.authed(Method::POST, path)?.json(body)).await
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ClientError> {
        let envelope: ApiResponse<T> = decode(req.send().await?).await?;
        envelope.data.ok_or(ClientError::EmptyResponse)
    }
}

/// Unwrap the `{success, data, error}` envelope. Failures keep the server's
/// message; non-JSON error bodies fall back to the raw text.
async fn decode<T: DeserializeOwned>(resp: Response) -> Result<ApiResponse<T>, ClientError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice::<ApiResponse<T>>(&bytes) {
        Ok(envelope) if envelope.success => Ok(envelope),
        Ok(envelope) => Err(ClientError::Api {
            status: status.as_u16(),
            message: envelope.error.unwrap_or_else(|| status.to_string()),
        }),
        Err(e) => Err(ClientError::Api {
            status: status.as_u16(),
            message: if status.is_success() {
                format!("malformed response: {}", e)
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            },
        }),
    }
}
