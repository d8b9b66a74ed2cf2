//! Advisory text from the Gemini `generateContent` REST API.
//!
//! At startup a list of candidate model ids is tried in order with a trivial
//! verification prompt; the first one that answers correctly is bound for the
//! lifetime of the process. Per request, a fixed template asks for three
//! labelled lines which are sliced back out of the response. Every failure on
//! that path degrades to placeholder text.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::AdvisoryError;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Tried in order; the first to pass verification is kept.
pub const CANDIDATE_MODELS: [&str; 4] = [
    "gemini-1.5-flash-latest",
    "gemini-1.5-pro-latest",
    "gemini-pro",
    "models/gemini-pro",
];

const VERIFY_PROMPT: &str = "What is 2+2?";
const VERIFY_EXPECTED: &str = "4";

pub const TEST_PROMPT: &str = "What is the capital of France?";

pub const SEVERITY_PLACEHOLDER: &str = "Failed to generate severity.";
pub const TREATMENT_PLACEHOLDER: &str = "Failed to generate treatment advice.";
pub const PREVENTION_PLACEHOLDER: &str = "Failed to generate prevention tips.";

const SEVERITY_LABEL: &str = "Severity:";
const TREATMENT_LABEL: &str = "Treatment:";
const PREVENTION_LABEL: &str = "Prevention:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advisory {
    pub severity: String,
    pub treatment: String,
    pub prevention: String,
}

impl Advisory {
    pub fn placeholder() -> Self {
        Self {
            severity: SEVERITY_PLACEHOLDER.to_string(),
            treatment: TREATMENT_PLACEHOLDER.to_string(),
            prevention: PREVENTION_PLACEHOLDER.to_string(),
        }
    }
}

/// Either generated text, or the placeholders together with why generation failed.
#[derive(Debug)]
pub enum AdvisoryOutcome {
    Generated(Advisory),
    Fallback { reason: AdvisoryError },
}

impl AdvisoryOutcome {
    pub fn is_generated(&self) -> bool {
        matches!(self, AdvisoryOutcome::Generated(_))
    }

    pub fn into_advisory(self) -> Advisory {
        match self {
            AdvisoryOutcome::Generated(advisory) => advisory,
            AdvisoryOutcome::Fallback { .. } => Advisory::placeholder(),
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// Sends a single-turn prompt and returns the concatenated candidate text.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String, AdvisoryError> {
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdvisoryError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.json::<GenerateResponse>().await?.text();
        if text.trim().is_empty() {
            return Err(AdvisoryError::EmptyResponse);
        }
        Ok(text)
    }
}

/// A client bound to the one model id that passed verification.
#[derive(Clone)]
pub struct AdvisoryBackend {
    client: GeminiClient,
    model: String,
}

impl AdvisoryBackend {
    /// Backend trial: the first candidate whose answer to the verification
    /// prompt contains the expected text wins.
    pub async fn select(client: GeminiClient, candidates: &[&str]) -> Result<Self, AdvisoryError> {
        for model in candidates {
            match client.generate(model, VERIFY_PROMPT).await {
                Ok(text) if text.contains(VERIFY_EXPECTED) => {
                    info!("Successfully initialized Gemini with model: {}", model);
                    return Ok(Self {
                        client,
                        model: model.to_string(),
                    });
                }
                Ok(text) => warn!("Model {} test failed: {}", model, text.trim()),
                Err(e) => warn!("Model {} failed: {}", model, e),
            }
        }
        Err(AdvisoryError::NoModelAvailable {
            tried: candidates.len(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, AdvisoryError> {
        self.client.generate(&self.model, prompt).await
    }

    /// Never fails: any error is logged and turned into a fallback outcome.
    pub async fn advise(&self, disease: &str) -> AdvisoryOutcome {
        match self.try_advise(disease).await {
            Ok(advisory) => AdvisoryOutcome::Generated(advisory),
            Err(reason) => {
                if reason.is_parse_failure() {
                    warn!("Gemini response for {} did not follow the template: {}", disease, reason);
                } else {
                    error!("Gemini content generation failed: {}", reason);
                }
                AdvisoryOutcome::Fallback { reason }
            }
        }
    }

    async fn try_advise(&self, disease: &str) -> Result<Advisory, AdvisoryError> {
        info!("Sending prompt to Gemini for disease: {}", disease);
        let text = self.generate(&advisory_prompt(disease)).await?;
        debug!("Gemini response: {}", text);
        parse_advisory(&text)
    }
}

/// Builds the backend from an optional key, logging instead of failing.
pub async fn configure(api_key: Option<&str>, base_url: &str) -> Option<AdvisoryBackend> {
    let result = match api_key.map(str::trim).filter(|key| !key.is_empty()) {
        Some(key) => AdvisoryBackend::select(GeminiClient::new(key, base_url), &CANDIDATE_MODELS).await,
        None => Err(AdvisoryError::MissingApiKey),
    };

    match result {
        Ok(backend) => Some(backend),
        Err(e) => {
            error!("Gemini configuration failed: {}", e);
            None
        }
    }
}

pub fn advisory_prompt(disease: &str) -> String {
    format!(
        "You are an expert plant pathologist. For the plant disease \"{disease}\", provide:\n\
         \n\
         1. SEVERITY: [Low/Medium/High] - Brief severity assessment\n\
         2. TREATMENT: Practical treatment recommendations (1 paragraph)\n\
         3. PREVENTION: Effective prevention tips (1 paragraph)\n\
         \n\
         Use concise language suitable for home gardeners. Output exactly in this format:\n\
         \n\
         Severity: [your severity assessment]\n\
         Treatment: [your treatment recommendations]\n\
         Prevention: [your prevention tips]\n"
    )
}

/// Slices the three labelled sections out of a response. Bold markers are
/// dropped first; each section runs to the next label or the end of text.
pub fn parse_advisory(text: &str) -> Result<Advisory, AdvisoryError> {
    let text = text.replace("**", "");

    let mut found = Vec::with_capacity(3);
    for label in [SEVERITY_LABEL, TREATMENT_LABEL, PREVENTION_LABEL] {
        let start = text.find(label).ok_or(AdvisoryError::MissingSection(label))?;
        found.push((start, label));
    }
    found.sort_by_key(|(start, _)| *start);

    let section = |label: &'static str| -> Result<String, AdvisoryError> {
        let pos = found
            .iter()
            .position(|(_, l)| *l == label)
            .ok_or(AdvisoryError::MissingSection(label))?;
        let begin = found[pos].0 + label.len();
        let end = found.get(pos + 1).map_or(text.len(), |(start, _)| *start);
        let body = text.get(begin..end).unwrap_or("").trim();
        if body.is_empty() {
            return Err(AdvisoryError::MissingSection(label));
        }
        Ok(body.to_string())
    };

    Ok(Advisory {
        severity: section(SEVERITY_LABEL)?,
        treatment: section(TREATMENT_LABEL)?,
        prevention: section(PREVENTION_LABEL)?,
    })
}
