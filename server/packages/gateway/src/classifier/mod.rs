//! Decides, once per request, whether the fast path can answer it.

pub mod keywords;
pub mod llm;

use std::sync::Arc;
use std::time::Duration;

use janus_completion::ChatMessage;
use janus_error::GatewayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::capability::GenerationFlags;
use crate::config::ClassifierConfig;

pub use llm::{LlmRouteVerifier, RouteDecision, RouteVerifier, ROUTE_TOOL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    Keyword,
    Llm,
    ExplicitFlag,
}

impl ConfidenceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Llm => "llm",
            Self::ExplicitFlag => "explicit_flag",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ComplexityVerdict {
    pub is_complex: bool,
    pub reason: String,
    pub evidence: Vec<String>,
    pub confidence_source: ConfidenceSource,
}

impl ComplexityVerdict {
    fn simple(reason: impl Into<String>, evidence: Vec<String>, source: ConfidenceSource) -> Self {
        Self {
            is_complex: false,
            reason: reason.into(),
            evidence,
            confidence_source: source,
        }
    }
}

#[derive(Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    verifier: Option<Arc<dyn RouteVerifier>>,
}

impl Classifier {
    /// Without a verifier, requests that match no keyword are simple.
    pub fn new(config: ClassifierConfig, verifier: Option<Arc<dyn RouteVerifier>>) -> Self {
        Self { config, verifier }
    }

    pub async fn classify(
        &self,
        messages: &[ChatMessage],
        flags: &GenerationFlags,
    ) -> ComplexityVerdict {
        let verdict = self.decide(messages, flags).await;
        info!(
            is_complex = verdict.is_complex,
            source = verdict.confidence_source.as_str(),
            reason = %verdict.reason,
            "request classified"
        );
        verdict
    }

    async fn decide(&self, messages: &[ChatMessage], flags: &GenerationFlags) -> ComplexityVerdict {
        let required = flags.required();
        if !required.is_empty() {
            return ComplexityVerdict {
                is_complex: true,
                reason: "explicit generation flags set".to_string(),
                evidence: required
                    .iter()
                    .map(|capability| capability.as_str().to_string())
                    .collect(),
                confidence_source: ConfidenceSource::ExplicitFlag,
            };
        }

        let Some(message) = messages.iter().rev().find(|message| message.role == "user") else {
            return ComplexityVerdict::simple(
                "no user message",
                Vec::new(),
                ConfidenceSource::Keyword,
            );
        };

        let text = message.content.text();
        if text.trim().is_empty() {
            let evidence = if message.content.has_images() {
                vec!["image_only".to_string()]
            } else {
                Vec::new()
            };
            return ComplexityVerdict::simple(
                "no text to classify",
                evidence,
                ConfidenceSource::Keyword,
            );
        }

        let matches = keywords::scan(&text);
        if !matches.is_empty() {
            return ComplexityVerdict {
                is_complex: true,
                reason: "complexity keyword matched".to_string(),
                evidence: matches.iter().map(ToString::to_string).collect(),
                confidence_source: ConfidenceSource::Keyword,
            };
        }

        match &self.verifier {
            Some(verifier) if self.config.llm_enabled => self.verify(verifier.as_ref(), &text).await,
            _ => ComplexityVerdict::simple(
                "no keyword matched",
                Vec::new(),
                ConfidenceSource::Keyword,
            ),
        }
    }

    async fn verify(&self, verifier: &dyn RouteVerifier, text: &str) -> ComplexityVerdict {
        let text = truncate_chars(text, self.config.max_chars);
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, verifier.verify(text)).await;
        let elapsed = started.elapsed();

        let err = match outcome {
            Ok(Ok(decision)) => {
                debug!(
                    needs_agent = decision.needs_agent,
                    elapsed_ms = duration_ms(elapsed),
                    "llm verification finished"
                );
                let reason = if decision.reason.trim().is_empty() {
                    "llm verification".to_string()
                } else {
                    decision.reason
                };
                return ComplexityVerdict {
                    is_complex: decision.needs_agent,
                    reason,
                    evidence: Vec::new(),
                    confidence_source: ConfidenceSource::Llm,
                };
            }
            Ok(Err(err)) => err,
            Err(_) => GatewayError::ClassificationTimeout {
                elapsed_ms: duration_ms(elapsed),
            },
        };

        warn!(
            error = %err,
            recoverable = err.is_recoverable(),
            "llm verification failed; routing to fast path"
        );
        ComplexityVerdict::simple(
            "llm verification unavailable; defaulted to fast path",
            vec![err.error_type().as_urn().to_string()],
            ConfidenceSource::Llm,
        )
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
