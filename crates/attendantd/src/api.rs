//! HTTP client for the attendance server.
//!
//! Every reply is a `{success, data, error}` envelope. Transport and
//! authorization failures are surfaced to the user here, once; callers only
//! see the classified [`ApiError`] and must not retry.

use crate::events::{Notifier, ToastLevel, UiEvent};
use attendant_core::{ArrivalRecord, CapturedSample, SessionWindow};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const CSRF_HEADER: &str = "X-CSRFToken";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session expired")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("unexpected server response: {0}")]
    Malformed(String),
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The server understood the request and said no.
    #[error("{0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Unreachable(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Reply of `GET /api/student/active-session`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActiveSession {
    pub active: bool,
    /// The nominal end has passed; only the grace window remains.
    #[serde(default)]
    pub grace: bool,
    #[serde(default)]
    pub already_marked: bool,
    pub session_id: Option<i64>,
    pub course_name: Option<String>,
    /// End of the grace window, as the server enforces it.
    pub end_time: Option<DateTime<Utc>>,
    pub attendance_token: Option<String>,
}

impl ActiveSession {
    /// Session window with the nominal end recovered from the grace-inclusive
    /// end the server reports.
    pub fn window(&self, now: DateTime<Utc>, grace: chrono::Duration) -> Option<SessionWindow> {
        if !self.active {
            return None;
        }
        Some(SessionWindow {
            session_id: self.session_id?,
            start_time: now,
            end_time: self.end_time? - grace,
        })
    }
}

/// Map a status code and body to the envelope's payload.
fn decode<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>, ApiError> {
    match status {
        401 => return Err(ApiError::Unauthorized),
        403 => {
            let message = serde_json::from_str::<ErrorBody>(body)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| "Access denied".to_string());
            return Err(ApiError::Forbidden(message));
        }
        _ => {}
    }

    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    if !envelope.success {
        return Err(ApiError::Rejected(
            envelope.error.unwrap_or_else(|| format!("request failed ({status})")),
        ));
    }
    Ok(envelope.data)
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    csrf_token: Option<String>,
    notifier: Notifier,
    signed_out: Arc<AtomicBool>,
}

impl ApiClient {
    pub fn new(base_url: &str, csrf_token: Option<String>, notifier: Notifier) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            csrf_token,
            notifier,
            signed_out: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Absolute URL for an API path; `/api` is prefixed when missing.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("/api") {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/api{path}", self.base_url)
        }
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::Acquire)
    }

    /// A request carrying the session cookie and anti-forgery token.
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.csrf_token {
            Some(token) => builder.header(CSRF_HEADER, token),
            None => builder,
        }
    }

    pub async fn active_session(&self) -> Result<ActiveSession, ApiError> {
        let session = self
            .send::<ActiveSession>(self.request(reqwest::Method::GET, "/student/active-session"))
            .await?;
        Ok(session.unwrap_or_default())
    }

    /// Submit one verification sample with the device's location.
    pub async fn mark_attendance(
        &self,
        session: &ActiveSession,
        sample: CapturedSample,
        latitude: f64,
        longitude: f64,
    ) -> Result<String, ApiError> {
        let session_id = session
            .session_id
            .ok_or_else(|| ApiError::Rejected("Session expired".to_string()))?;
        let form = Form::new()
            .part("image", jpeg_part(sample)?)
            .text("session_id", session_id.to_string())
            .text("attendance_token", session.attendance_token.clone().unwrap_or_default())
            .text("latitude", latitude.to_string())
            .text("longitude", longitude.to_string());

        let reply = self
            .send::<serde_json::Value>(
                self.request(reqwest::Method::POST, "/student/mark-attendance")
                    .multipart(form),
            )
            .await?;
        Ok(message_or(reply, "Attendance Marked Successfully"))
    }

    /// Upload every enrollment sample in one request.
    pub async fn register_face(&self, samples: Vec<CapturedSample>) -> Result<String, ApiError> {
        let mut form = Form::new();
        for sample in samples {
            form = form.part("images", jpeg_part(sample)?);
        }
        let reply = self
            .send::<serde_json::Value>(self.request(reqwest::Method::POST, "/student/register-face").multipart(form))
            .await?;
        Ok(message_or(reply, "Face registered successfully"))
    }

    pub async fn session_students(&self, session_id: i64) -> Result<Vec<ArrivalRecord>, ApiError> {
        let path = format!("/faculty/session/{session_id}/students");
        let records = self
            .send::<Vec<ArrivalRecord>>(self.request(reqwest::Method::GET, &path))
            .await?;
        Ok(records.unwrap_or_default())
    }

    /// Endpoint of the session's push channel.
    pub fn live_path(session_id: i64) -> String {
        format!("/faculty/session-live/{session_id}")
    }

    async fn send<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<Option<T>, ApiError> {
        let result = fetch(builder).await;
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    /// Surface a request failure to the user. Sign-out is announced once.
    pub(crate) fn report(&self, error: &ApiError) {
        match error {
            ApiError::Unauthorized => {
                if self.signed_out.swap(true, Ordering::AcqRel) {
                    return;
                }
                self.notifier
                    .toast(ToastLevel::Error, "Session expired. Please login again.");
                self.notifier.emit(UiEvent::SignedOut);
            }
            ApiError::Forbidden(message) => self.notifier.toast(ToastLevel::Error, message.clone()),
            ApiError::Malformed(detail) => {
                tracing::warn!(%detail, "invalid JSON response");
                self.notifier.toast(ToastLevel::Error, "Unexpected server response");
            }
            ApiError::Unreachable(detail) => {
                tracing::warn!(%detail, "request failed");
                self.notifier.toast(ToastLevel::Error, "Server unreachable");
            }
            ApiError::Rejected(_) => {}
        }
    }
}

/// The server calls the views depend on.
pub trait AttendanceServer: Send + Sync {
    fn active_session(&self) -> BoxFuture<'_, Result<ActiveSession, ApiError>>;
    fn mark_attendance(
        &self,
        session: ActiveSession,
        sample: CapturedSample,
        latitude: f64,
        longitude: f64,
    ) -> BoxFuture<'_, Result<String, ApiError>>;
    fn register_face(&self, samples: Vec<CapturedSample>) -> BoxFuture<'_, Result<String, ApiError>>;
    fn session_students(&self, session_id: i64) -> BoxFuture<'_, Result<Vec<ArrivalRecord>, ApiError>>;
    /// The server rejected our credentials; nothing works until sign-in.
    fn is_signed_out(&self) -> bool;
}

impl AttendanceServer for ApiClient {
    fn active_session(&self) -> BoxFuture<'_, Result<ActiveSession, ApiError>> {
        Box::pin(ApiClient::active_session(self))
    }

    fn mark_attendance(
        &self,
        session: ActiveSession,
        sample: CapturedSample,
        latitude: f64,
        longitude: f64,
    ) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(async move { ApiClient::mark_attendance(self, &session, sample, latitude, longitude).await })
    }

    fn register_face(&self, samples: Vec<CapturedSample>) -> BoxFuture<'_, Result<String, ApiError>> {
        Box::pin(ApiClient::register_face(self, samples))
    }

    fn session_students(&self, session_id: i64) -> BoxFuture<'_, Result<Vec<ArrivalRecord>, ApiError>> {
        Box::pin(ApiClient::session_students(self, session_id))
    }

    fn is_signed_out(&self) -> bool {
        ApiClient::is_signed_out(self)
    }
}

async fn fetch<T: DeserializeOwned>(builder: reqwest::RequestBuilder) -> Result<Option<T>, ApiError> {
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    decode(status, &body)
}

fn jpeg_part(sample: CapturedSample) -> Result<Part, ApiError> {
    Ok(Part::bytes(sample.jpeg).file_name("face.jpg").mime_str("image/jpeg")?)
}

fn message_or(reply: Option<serde_json::Value>, fallback: &str) -> String {
    match reply {
        Some(serde_json::Value::String(message)) => message,
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> (ApiClient, Notifier) {
        let notifier = Notifier::new(8);
        let client = ApiClient::new("http://campus.local/", Some("tok".into()), notifier.clone()).unwrap();
        (client, notifier)
    }

    #[test]
    fn test_url_prefixes_api() {
        let (client, _) = client();
        assert_eq!(client.url("/student/active-session"), "http://campus.local/api/student/active-session");
        assert_eq!(client.url("/api/faculty/session/4/students"), "http://campus.local/api/faculty/session/4/students");
        assert_eq!(ApiClient::live_path(4), "/faculty/session-live/4");
    }

    #[test]
    fn test_decode_statuses() {
        assert!(matches!(decode::<i64>(401, ""), Err(ApiError::Unauthorized)));
        assert!(matches!(
            decode::<i64>(403, r#"{"success":false,"error":"Outside allowed campus"}"#),
            Err(ApiError::Forbidden(m)) if m == "Outside allowed campus"
        ));
        assert!(matches!(decode::<i64>(403, "<html>"), Err(ApiError::Forbidden(m)) if m == "Access denied"));
        assert!(matches!(decode::<i64>(500, "<html>"), Err(ApiError::Malformed(_))));
        assert!(matches!(
            decode::<i64>(400, r#"{"success":false,"error":"Attendance already marked"}"#),
            Err(ApiError::Rejected(m)) if m == "Attendance already marked"
        ));
        assert_eq!(decode::<i64>(200, r#"{"success":true,"data":7}"#).unwrap(), Some(7));
    }

    #[test]
    fn test_decode_active_session() {
        let body = r#"{"success":true,"data":{"active":true,"grace":false,"already_marked":false,
            "session_id":12,"course_name":"Networks","end_time":"2025-03-01T10:00:30+00:00",
            "attendance_token":"abc"}}"#;
        let session = decode::<ActiveSession>(200, body).unwrap().unwrap();
        assert_eq!(session.session_id, Some(12));

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let window = session.window(now, chrono::Duration::seconds(30)).unwrap();
        assert_eq!(window.end_time, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());

        let inactive = decode::<ActiveSession>(200, r#"{"success":true,"data":{"active":false}}"#)
            .unwrap()
            .unwrap();
        assert!(inactive.window(now, chrono::Duration::seconds(30)).is_none());
    }

    #[tokio::test]
    async fn test_sign_out_announced_once() {
        let (client, notifier) = client();
        let mut rx = notifier.subscribe();
        client.report(&ApiError::Unauthorized);
        client.report(&ApiError::Unauthorized);
        assert!(client.is_signed_out());

        assert!(matches!(rx.recv().await.unwrap(), UiEvent::Toast { .. }));
        assert_eq!(rx.recv().await.unwrap(), UiEvent::SignedOut);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejection_is_not_toasted_here() {
        let (client, notifier) = client();
        let mut rx = notifier.subscribe();
        client.report(&ApiError::Rejected("Face verification failed".into()));
        assert!(rx.try_recv().is_err());
    }
}
