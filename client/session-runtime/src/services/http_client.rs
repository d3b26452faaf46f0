use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use url::Url;

use crate::config::ApiSettings;
use crate::error::{Result, SessionError};
use crate::metrics::track_remote_call;
use crate::models::answer::{
    AnswerSubmission, BatchDraftAck, BatchSubmitAck, DraftAck, DraftPayload, SubmitResult,
};
use crate::models::integrity::AuditEvent;
use crate::models::session::{BreakEnded, BreakStarted, CompletionAck, SessionSnapshot};

use super::remote::{AuditLogApi, DraftApi, SessionApi};

/// Which error class a 401/403/404 maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// The token addresses the session itself; losing it is fatal.
    Session,
    Answer,
}

/// reqwest binding of the assessment backend.
#[derive(Clone)]
pub struct HttpAssessmentClient {
    http_client: Client,
    base_url: Url,
}

impl HttpAssessmentClient {
    pub fn new(settings: &ApiSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let base_url = Url::parse(&settings.base_url)
            .with_context(|| format!("Invalid api.base_url {}", settings.base_url))?;
        let http_client = Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    fn url(&self, endpoint: &'static str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SessionError::permanent(endpoint, 0, "base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn session_url(&self, endpoint: &'static str, token: &str, action: &[&str]) -> Result<Url> {
        let mut segments = vec!["api", "tests", "token", token];
        segments.extend_from_slice(action);
        self.url(endpoint, &segments)
    }

    async fn send<B, T>(
        &self,
        endpoint: &'static str,
        scope: Scope,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        track_remote_call(endpoint, async move {
            let mut request = self.http_client.request(method, url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| transport_error(endpoint, &e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(endpoint, scope, status, &body));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| SessionError::permanent(endpoint, status.as_u16(), format!("malformed response: {}", e)))
        })
        .await
    }
}

fn transport_error(endpoint: &str, err: &reqwest::Error) -> SessionError {
    if err.is_timeout() {
        SessionError::transient(endpoint, "request timed out")
    } else {
        SessionError::transient(endpoint, err.to_string())
    }
}

/// Pulls `detail` out of a FastAPI-style error body, falling back to the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn classify_status(endpoint: &str, scope: Scope, status: StatusCode, body: &str) -> SessionError {
    let detail = error_detail(body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SessionError::transient(endpoint, format!("{}: {}", status, detail))
        }
        s if s.is_server_error() => SessionError::transient(endpoint, format!("{}: {}", status, detail)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
            if scope == Scope::Session =>
        {
            SessionError::SessionIdentity(detail)
        }
        s => SessionError::permanent(endpoint, s.as_u16(), detail),
    }
}

fn is_already_completed(err: &SessionError) -> bool {
    match err {
        SessionError::PermanentServer {
            status, message, ..
        } => *status == 400 && message.to_lowercase().contains("already completed"),
        _ => false,
    }
}

#[async_trait]
impl SessionApi for HttpAssessmentClient {
    async fn get_session(&self, token: &str) -> Result<SessionSnapshot> {
        let url = self.session_url("getSession", token, &[])?;
        self.send::<(), _>("getSession", Scope::Session, Method::GET, url, None)
            .await
    }

    async fn start_session(&self, token: &str) -> Result<SessionSnapshot> {
        let url = self.session_url("startSession", token, &["start"])?;
        self.send::<(), _>("startSession", Scope::Session, Method::POST, url, None)
            .await
    }

    async fn complete_session(&self, token: &str) -> Result<CompletionAck> {
        let url = self.session_url("completeSession", token, &["complete"])?;
        let result: Result<serde_json::Value> = self
            .send::<(), _>("completeSession", Scope::Session, Method::POST, url, None)
            .await;

        match result {
            Ok(_) => Ok(CompletionAck::Completed),
            Err(e) if is_already_completed(&e) => {
                tracing::info!("Session {} was already completed on the server", token);
                Ok(CompletionAck::AlreadyCompleted)
            }
            Err(e) => Err(e),
        }
    }

    async fn start_break(&self, token: &str) -> Result<BreakStarted> {
        let url = self.session_url("startBreak", token, &["break", "start"])?;
        self.send::<(), _>("startBreak", Scope::Session, Method::POST, url, None)
            .await
    }

    async fn end_break(&self, token: &str) -> Result<BreakEnded> {
        let url = self.session_url("endBreak", token, &["break", "end"])?;
        self.send::<(), _>("endBreak", Scope::Session, Method::POST, url, None)
            .await
    }
}

#[async_trait]
impl AuditLogApi for HttpAssessmentClient {
    async fn log_event(&self, token: &str, event: &AuditEvent) -> Result<()> {
        let url = self.session_url("logEvent", token, &["anti-cheat"])?;
        let _: serde_json::Value = self
            .send("logEvent", Scope::Session, Method::POST, url, Some(event))
            .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct WithToken<'a, T: Serialize> {
    access_token: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct DraftBatch<'a> {
    access_token: &'a str,
    drafts: &'a [DraftPayload],
}

#[derive(Serialize)]
struct SubmissionBatch<'a> {
    access_token: &'a str,
    answers: &'a [AnswerSubmission],
}

#[async_trait]
impl DraftApi for HttpAssessmentClient {
    async fn save_draft(&self, token: &str, draft: &DraftPayload) -> Result<DraftAck> {
        let url = self.url("saveDraft", &["api", "answers", "draft"])?;
        let body = WithToken {
            access_token: token,
            body: draft,
        };
        self.send("saveDraft", Scope::Answer, Method::POST, url, Some(&body))
            .await
    }

    async fn batch_save_drafts(&self, token: &str, drafts: &[DraftPayload]) -> Result<BatchDraftAck> {
        let url = self.url("batchSaveDrafts", &["api", "answers", "batch-draft"])?;
        let body = DraftBatch {
            access_token: token,
            drafts,
        };
        self.send("batchSaveDrafts", Scope::Answer, Method::POST, url, Some(&body))
            .await
    }

    async fn submit_answer(&self, token: &str, submission: &AnswerSubmission) -> Result<SubmitResult> {
        let url = self.url("submitAnswer", &["api", "answers", "submit"])?;
        let body = WithToken {
            access_token: token,
            body: submission,
        };
        self.send("submitAnswer", Scope::Answer, Method::POST, url, Some(&body))
            .await
    }

    async fn batch_submit(&self, token: &str, submissions: &[AnswerSubmission]) -> Result<BatchSubmitAck> {
        let url = self.url("batchSubmit", &["api", "answers", "batch-submit"])?;
        let body = SubmissionBatch {
            access_token: token,
            answers: submissions,
        };
        self.send("batchSubmit", Scope::Answer, Method::POST, url, Some(&body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpAssessmentClient {
        HttpAssessmentClient::new(&ApiSettings {
            base_url: base.to_string(),
            request_timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn session_routes_escape_the_token() {
        let client = client("http://assess.local/");
        let url = client
            .session_url("startBreak", "ab/c d", &["break", "start"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://assess.local/api/tests/token/ab%2Fc%20d/break/start"
        );
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let client = client("http://assess.local/backend");
        let url = client.url("saveDraft", &["api", "answers", "draft"]).unwrap();
        assert_eq!(url.as_str(), "http://assess.local/backend/api/answers/draft");
    }

    #[test]
    fn statuses_map_to_error_classes() {
        let transient = classify_status("saveDraft", Scope::Answer, StatusCode::BAD_GATEWAY, "");
        assert!(transient.is_retryable());

        let throttled = classify_status("saveDraft", Scope::Answer, StatusCode::TOO_MANY_REQUESTS, "");
        assert!(throttled.is_retryable());

        let gone = classify_status(
            "getSession",
            Scope::Session,
            StatusCode::NOT_FOUND,
            r#"{"detail":"Test not found"}"#,
        );
        assert_eq!(gone, SessionError::SessionIdentity("Test not found".into()));

        let missing_question = classify_status(
            "submitAnswer",
            Scope::Answer,
            StatusCode::NOT_FOUND,
            r#"{"detail":"Question not found"}"#,
        );
        assert_eq!(
            missing_question,
            SessionError::permanent("submitAnswer", 404, "Question not found")
        );
    }

    #[test]
    fn already_completed_is_recognised() {
        let err = classify_status(
            "completeSession",
            Scope::Session,
            StatusCode::BAD_REQUEST,
            r#"{"detail":"Test already completed"}"#,
        );
        assert!(is_already_completed(&err));

        let other = classify_status(
            "completeSession",
            Scope::Session,
            StatusCode::BAD_REQUEST,
            r#"{"detail":"Test is not in progress"}"#,
        );
        assert!(!is_already_completed(&other));
    }
}
