//! Medra backend HTTP client (http://127.0.0.1:8000 by default).
//! JSON in and out; every authenticated call carries `Authorization: Bearer <token>`.

use crate::api::types::{
    AuthResponse, ChatSummary, Message, NewPatient, Patient, PatientProfile, UploadInfo, UserInfo,
};
use crate::session::Credential;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Client for the Medra REST API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No credential is active; nothing was sent.
    #[error("not signed in")]
    Unauthenticated,
    /// Non-2xx response. Displays the backend's body text unchanged.
    #[error("{body}")]
    Backend { status: StatusCode, body: String },
    #[error("api request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    /// HTTP status when the backend answered with an error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    email: &'a str,
    password: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct GoogleBody<'a> {
    token: &'a str,
}

impl ApiClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an API path (path starts with '/').
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Uploaded files come back as server-relative `/storage/..` paths; make them absolute.
    pub fn resolve_media_url(&self, url: &str) -> String {
        if url.starts_with('/') {
            self.url(url)
        } else {
            url.to_string()
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Builder with bearer auth. Fails before touching the network when the token is empty.
    fn authed(
        &self,
        method: Method,
        path: &str,
        credential: &Credential,
    ) -> Result<RequestBuilder, ApiError> {
        if credential.token.trim().is_empty() {
            return Err(ApiError::Unauthenticated);
        }
        Ok(self.request(method, path).bearer_auth(&credential.token))
    }

    async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, ApiError> {
        let res = req.send().await?;
        let res = error_for_status(res).await?;
        Ok(res.json().await?)
    }

    /// POST /auth/login.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, ApiError> {
        let req = self
            .request(Method::POST, "/auth/login")
            .json(&LoginBody { email, password });
        Self::send_json(req).await
    }

    /// POST /auth/register.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<AuthResponse, ApiError> {
        let req = self.request(Method::POST, "/auth/register").json(&RegisterBody {
            email,
            password,
            name,
        });
        Self::send_json(req).await
    }

    /// POST /auth/google: exchange a Google ID token for a session token.
    pub async fn google_auth(&self, id_token: &str) -> Result<AuthResponse, ApiError> {
        let req = self
            .request(Method::POST, "/auth/google")
            .json(&GoogleBody { token: id_token });
        Self::send_json(req).await
    }

    /// GET /auth/me: identity behind the credential.
    pub async fn me(&self, credential: &Credential) -> Result<UserInfo, ApiError> {
        Self::send_json(self.authed(Method::GET, "/auth/me", credential)?).await
    }

    /// POST /auth/refresh: renewed token for the credential.
    pub async fn refresh(&self, credential: &Credential) -> Result<AuthResponse, ApiError> {
        Self::send_json(self.authed(Method::POST, "/auth/refresh", credential)?).await
    }

    /// GET /patients: newest first.
    pub async fn list_patients(&self, credential: &Credential) -> Result<Vec<Patient>, ApiError> {
        Self::send_json(self.authed(Method::GET, "/patients", credential)?).await
    }

    /// POST /patients.
    pub async fn create_patient(
        &self,
        credential: &Credential,
        patient: &NewPatient,
    ) -> Result<Patient, ApiError> {
        let req = self.authed(Method::POST, "/patients", credential)?.json(patient);
        Self::send_json(req).await
    }

    /// GET /patients/{id}.
    pub async fn patient_profile(
        &self,
        credential: &Credential,
        patient_id: &str,
    ) -> Result<PatientProfile, ApiError> {
        let path = format!("/patients/{}", patient_id);
        Self::send_json(self.authed(Method::GET, &path, credential)?).await
    }

    /// DELETE /patients/{id}. The response body is ignored.
    pub async fn delete_patient(
        &self,
        credential: &Credential,
        patient_id: &str,
    ) -> Result<(), ApiError> {
        let path = format!("/patients/{}", patient_id);
        let res = self.authed(Method::DELETE, &path, credential)?.send().await?;
        error_for_status(res).await?;
        Ok(())
    }

    /// GET /chats, optionally filtered to one patient.
    pub async fn list_chats(
        &self,
        credential: &Credential,
        patient_id: Option<&str>,
    ) -> Result<Vec<ChatSummary>, ApiError> {
        let mut req = self.authed(Method::GET, "/chats", credential)?;
        if let Some(id) = patient_id {
            req = req.query(&[("patient_id", id)]);
        }
        Self::send_json(req).await
    }

    /// GET /chats/general: chats not tied to a patient.
    pub async fn list_general_chats(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ChatSummary>, ApiError> {
        Self::send_json(self.authed(Method::GET, "/chats/general", credential)?).await
    }

    /// POST /chats?patient_id=&title=: new consult for a patient.
    pub async fn create_chat(
        &self,
        credential: &Credential,
        patient_id: &str,
        title: Option<&str>,
    ) -> Result<ChatSummary, ApiError> {
        let mut req = self
            .authed(Method::POST, "/chats", credential)?
            .query(&[("patient_id", patient_id)]);
        if let Some(t) = title {
            req = req.query(&[("title", t)]);
        }
        Self::send_json(req).await
    }

    /// POST /chats/general?title=.
    pub async fn create_general_chat(
        &self,
        credential: &Credential,
        title: Option<&str>,
    ) -> Result<ChatSummary, ApiError> {
        let mut req = self.authed(Method::POST, "/chats/general", credential)?;
        if let Some(t) = title {
            req = req.query(&[("title", t)]);
        }
        Self::send_json(req).await
    }

    /// GET /chats/{id}/messages.
    pub async fn chat_messages(
        &self,
        credential: &Credential,
        chat_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let path = format!("/chats/{}/messages", chat_id);
        Self::send_json(self.authed(Method::GET, &path, credential)?).await
    }

    /// GET /messages?chat_id=: oldest first.
    pub async fn list_messages(
        &self,
        credential: &Credential,
        chat_id: &str,
    ) -> Result<Vec<Message>, ApiError> {
        let req = self
            .authed(Method::GET, "/messages", credential)?
            .query(&[("chat_id", chat_id)]);
        Self::send_json(req).await
    }

    /// POST /upload as multipart form with a single `file` field.
    pub async fn upload(
        &self,
        credential: &Credential,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadInfo, ApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let req = self.authed(Method::POST, "/upload", credential)?.multipart(form);
        Self::send_json(req).await
    }
}

/// Turn a non-2xx response into [`ApiError::Backend`] carrying the body text.
pub(crate) async fn error_for_status(res: Response) -> Result<Response, ApiError> {
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ApiError::Backend { status, body });
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = ApiClient::new(Some("http://api.test/".to_string()));
        assert_eq!(client.base_url(), "http://api.test");
        assert_eq!(client.url("/patients"), "http://api.test/patients");
    }

    #[test]
    fn relative_media_urls_get_base_prefix() {
        let client = ApiClient::new(Some("http://api.test".to_string()));
        assert_eq!(
            client.resolve_media_url("/storage/a.png"),
            "http://api.test/storage/a.png"
        );
        assert_eq!(
            client.resolve_media_url("https://cdn.test/a.png"),
            "https://cdn.test/a.png"
        );
    }

    #[tokio::test]
    async fn empty_token_fails_without_request() {
        // Port 9 (discard) on loopback: nothing would answer, but we must not get that far.
        let client = ApiClient::new(Some("http://127.0.0.1:9".to_string()));
        let credential = Credential::new("", "nobody");
        let err = client.list_patients(&credential).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated));
    }

    #[test]
    fn backend_error_displays_body_unchanged() {
        let err = ApiError::Backend {
            status: StatusCode::CONFLICT,
            body: "Email exists".to_string(),
        };
        assert_eq!(err.to_string(), "Email exists");
        assert_eq!(err.status(), Some(StatusCode::CONFLICT));
    }
}
