/// Optional refinement of the baseline narrative by an external chat
/// completion service.
///
/// The assembler only ever sees two outcomes: refined text, or an explicit
/// instruction to keep the baseline. Errors never cross this boundary.
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::event::EventKey;
use crate::schema::narrative::TemplateId;

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("no API key in environment variable {0}")]
    MissingApiKey(String),
    #[error("cannot connect to {0}")]
    Connection(String),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("HTTP client error: {0}")]
    HttpClient(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    ResponseParsing(String),
    #[error("response contained no text")]
    EmptyResponse,
}

/// Everything the refinement step receives. Owned so it can move onto a
/// worker thread.
#[derive(Debug, Clone)]
pub struct RefinementJob {
    pub key: EventKey,
    pub template: TemplateId,
    pub baseline: String,
    /// Sorted `- name: value` listing of the resolved facts.
    pub facts: String,
    pub guide: Arc<str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementOutcome {
    Refined(String),
    /// Keep the baseline; the reason is logged.
    UseBaseline(String),
}

pub trait Refiner: Send + Sync {
    fn refine(&self, job: &RefinementJob) -> RefinementOutcome;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ceiling for one refinement, in seconds. Also the local budget the
    /// assembler waits before keeping the baseline.
    pub timeout_secs: u64,
    pub api_key_env: String,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 2500,
            timeout_secs: 45,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl RefinementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub fn system_prompt(guide: &str) -> String {
    format!(
        "You are a medical writer preparing serious adverse event narratives for a clinical study report. \
Rewrite the narrative you are given so that it reads fluently while following every convention in the guide below. \
Use only the facts provided. Do not add, remove, or change any fact, date, study day, or number. \
Return only the narrative text.\n\nWRITING GUIDE:\n{guide}"
    )
}

pub fn user_prompt(job: &RefinementJob) -> String {
    format!(
        "Template: {}\nSubject: {}\nSequence: {}\n\nFACTS:\n{}\n\nBASELINE NARRATIVE:\n{}",
        job.template, job.key.subject_id, job.key.sequence, job.facts, job.baseline
    )
}

/// Reject refined text that is empty or carries a placeholder marker.
pub fn accept_refined(text: &str) -> RefinementOutcome {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        RefinementOutcome::UseBaseline("refined text is empty".to_string())
    } else if trimmed.contains(['{', '}']) {
        RefinementOutcome::UseBaseline("refined text contains a placeholder marker".to_string())
    } else {
        RefinementOutcome::Refined(trimmed.to_string())
    }
}

/// Run `refiner` on a worker thread and wait at most `budget`. A timeout,
/// a panicking worker, or a rejected text all keep the baseline.
pub fn refine_within(
    refiner: Arc<dyn Refiner>,
    job: RefinementJob,
    budget: Duration,
) -> RefinementOutcome {
    let (tx, rx) = mpsc::channel();
    let key = job.key.clone();
    let spawned = thread::Builder::new()
        .name(format!("refine-{key}"))
        .spawn(move || {
            let outcome = refiner.refine(&job);
            // The receiver may have given up already.
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return RefinementOutcome::UseBaseline(format!("cannot start refinement worker: {e}"));
    }

    match rx.recv_timeout(budget) {
        Ok(RefinementOutcome::Refined(text)) => accept_refined(&text),
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            warn!(event = %key, budget_ms = budget.as_millis() as u64, "refinement exceeded budget");
            RefinementOutcome::UseBaseline(format!(
                "refinement exceeded {}ms budget",
                budget.as_millis()
            ))
        }
        Err(RecvTimeoutError::Disconnected) => {
            RefinementOutcome::UseBaseline("refinement worker stopped without a result".to_string())
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Refiner backed by an OpenAI-compatible chat completions endpoint.
/// One request per job, no retries.
pub struct ChatCompletionRefiner {
    client: reqwest::blocking::Client,
    config: RefinementConfig,
    api_key: Option<String>,
}

impl ChatCompletionRefiner {
    /// Build a client with the configured timeout. The API key is read from
    /// the configured environment variable; a missing key is reported per
    /// job as a fallback, not here.
    pub fn from_config(config: RefinementConfig) -> Result<Self, RefineError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RefineError::HttpClient(e.to_string()))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    fn request(&self, job: &RefinementJob) -> Result<String, RefineError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| RefineError::MissingApiKey(self.config.api_key_env.clone()))?;
        let system = system_prompt(&job.guide);
        let user = user_prompt(job);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    RefineError::Connection(self.config.endpoint.clone())
                } else if e.is_timeout() {
                    RefineError::Timeout(self.config.timeout_secs)
                } else {
                    RefineError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RefineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| RefineError::ResponseParsing(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(RefineError::EmptyResponse)
    }
}

impl Refiner for ChatCompletionRefiner {
    fn refine(&self, job: &RefinementJob) -> RefinementOutcome {
        match self.request(job) {
            Ok(text) => {
                debug!(event = %job.key, model = %self.config.model, "refinement returned text");
                accept_refined(&text)
            }
            Err(e) => RefinementOutcome::UseBaseline(e.to_string()),
        }
    }
}
