use std::{
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{
    Client, RequestBuilder, StatusCode,
    multipart::{Form, Part},
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;
use wadesk_core::{
    Ack, AuthStatusResponse, ErrorBody, OutgoingMessage, QrRequestResponse, SendReceipt,
    StatusPayload, Template,
};

use crate::error::ClientError;

pub const STATUS_PATH: &str = "/status";
pub const QR_REQUEST_PATH: &str = "/qr-request";
pub const QR_EXPIRE_PATH: &str = "/qr-expire";
pub const AUTH_STATUS_PATH: &str = "/auth-status";
pub const AUTH_RESET_PATH: &str = "/auth-reset";
pub const SEND_MESSAGE_PATH: &str = "/send-message";
pub const TEMPLATES_PATH: &str = "/templates";

/// Bearer token shared by HTTP calls and the push channel.
///
/// Once expired, every authenticated call fails fast until a new token is
/// installed with [`Session::reauthenticate`].
#[derive(Debug, Default)]
pub struct Session {
    token: RwLock<Option<String>>,
    expired: AtomicBool,
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|value| !value.trim().is_empty())),
            expired: AtomicBool::new(false),
        }
    }

    pub fn bearer(&self) -> Result<String, ClientError> {
        if self.is_expired() {
            return Err(ClientError::SessionExpired);
        }
        let token = self.token.read().ok().and_then(|guard| guard.clone());
        match token {
            Some(token) => Ok(token),
            None => {
                self.expire();
                Err(ClientError::SessionExpired)
            }
        }
    }

    pub fn expire(&self) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            warn!("session marked expired");
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn reauthenticate(&self, token: String) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
        self.expired.store(false, Ordering::SeqCst);
    }
}

/// Status and QR administration calls used by the synchronizer.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    async fn fetch_status(&self) -> Result<StatusPayload, ClientError>;
    async fn request_qr(&self) -> Result<QrRequestResponse, ClientError>;
    async fn expire_qr(&self) -> Result<Ack, ClientError>;
    async fn auth_status(&self) -> Result<AuthStatusResponse, ClientError>;
    async fn reset_auth(&self) -> Result<Ack, ClientError>;
}

/// Calls used by the message form.
#[async_trait]
pub trait MessageBackend: Send + Sync {
    async fn templates(&self) -> Result<Vec<Template>, ClientError>;
    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt, ClientError>;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    session: Arc<Session>,
}

impl BackendClient {
    pub fn new(
        base_url: &str,
        session: Arc<Session>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let parsed = Url::parse(base_url.trim())?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_owned(),
            session,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute<T>(&self, path: &str, request: RequestBuilder) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let token = self.session.bearer()?;
        debug!(path, "backend request");
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!(path, "backend returned 401");
            self.session.expire();
            return Err(ClientError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.json::<ErrorBody>().await.unwrap_or_default();
            if !body.errors.is_empty() {
                return Err(ClientError::Rejected(body.errors));
            }
            return Err(ClientError::Backend {
                path: path.to_owned(),
                status: status.as_u16(),
                message: body.message.unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_owned()
                }),
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let request = self.http.get(self.endpoint(path));
        self.execute(path, request).await
    }

    async fn post_json<T>(&self, path: &str) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
    {
        let request = self.http.post(self.endpoint(path));
        self.execute(path, request).await
    }
}

#[async_trait]
impl StatusBackend for BackendClient {
    async fn fetch_status(&self) -> Result<StatusPayload, ClientError> {
        self.get_json(STATUS_PATH).await
    }

    async fn request_qr(&self) -> Result<QrRequestResponse, ClientError> {
        self.post_json(QR_REQUEST_PATH).await
    }

    async fn expire_qr(&self) -> Result<Ack, ClientError> {
        self.post_json(QR_EXPIRE_PATH).await
    }

    async fn auth_status(&self) -> Result<AuthStatusResponse, ClientError> {
        self.get_json(AUTH_STATUS_PATH).await
    }

    async fn reset_auth(&self) -> Result<Ack, ClientError> {
        self.post_json(AUTH_RESET_PATH).await
    }
}

#[async_trait]
impl MessageBackend for BackendClient {
    async fn templates(&self) -> Result<Vec<Template>, ClientError> {
        self.get_json(TEMPLATES_PATH).await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt, ClientError> {
        let mut form = Form::new()
            .text("recipient", message.recipient.clone())
            .text("templateId", message.template_id.clone())
            .text("displayName", message.display_name.clone());
        if let Some(date) = &message.date {
            form = form.text("date", date.clone());
        }
        if let Some(time) = &message.time {
            form = form.text("time", time.clone());
        }
        if let Some(attachment) = &message.attachment {
            let part = Part::bytes(attachment.bytes.clone())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.content_type)?;
            form = form.part("attachment", part);
        }

        let request = self.http.post(self.endpoint(SEND_MESSAGE_PATH)).multipart(form);
        self.execute(SEND_MESSAGE_PATH, request).await
    }
}
