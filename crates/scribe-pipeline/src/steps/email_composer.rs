//! Final composition: turn the template and gathered context into the outreach email.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use scribe_types::{Result, ScribeError, StepError};

use crate::context::PipelineContext;
use crate::step::{PipelineStep, StepKind, StepOutput};
use crate::steps::arxiv_helper::{Enrichment, Paper};
use crate::steps::template_parser::{TemplateAnalysis, TemplateType};
use crate::steps::web_scraper::WebContent;

/// Everything a composer sees for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeRequest {
    pub recipient_name: String,
    pub recipient_interest: String,
    pub template: String,
    pub template_type: TemplateType,
    pub web_content: String,
    pub papers: Vec<Paper>,
}

#[async_trait]
pub trait Composer: Send + Sync {
    /// Identifier recorded in the artifact metadata.
    fn name(&self) -> &str;

    async fn compose(&self, request: &ComposeRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// AnthropicComposer
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You write short, personal cold outreach emails. \
Keep the sender's template wording and tone, and replace every {{placeholder}} \
with specific details about the recipient drawn from the context provided. \
Output only the finished email body.";

#[derive(Debug)]
pub struct AnthropicComposer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicComposer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 2000,
            temperature: 0.7,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn from_env() -> Result<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ScribeError::Validation("ANTHROPIC_API_KEY is not set".into()))?;
        Ok(Self::new(key))
    }
}

fn user_prompt(request: &ComposeRequest) -> String {
    let mut prompt = format!(
        "Recipient: {}\nTheir interest: {}\nTemplate type: {:?}\n\n<template>\n{}\n</template>\n",
        request.recipient_name, request.recipient_interest, request.template_type, request.template
    );
    if !request.web_content.is_empty() {
        prompt.push_str(&format!("\n<web_context>\n{}\n</web_context>\n", request.web_content));
    }
    if !request.papers.is_empty() {
        prompt.push_str("\n<publications>\n");
        for paper in &request.papers {
            match paper.year {
                Some(year) => prompt.push_str(&format!("- {} ({year})\n", paper.title)),
                None => prompt.push_str(&format!("- {}\n", paper.title)),
            }
        }
        prompt.push_str("</publications>\n");
    }
    prompt
}

#[async_trait]
impl Composer for AnthropicComposer {
    fn name(&self) -> &str {
        &self.model
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": SYSTEM_PROMPT,
            "messages": [{ "role": "user", "content": user_prompt(request) }],
        });

        let transport = |e: reqwest::Error| ScribeError::Http {
            service: "anthropic".into(),
            status: 0,
            message: e.to_string(),
        };
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(ScribeError::Http {
                service: "anthropic".into(),
                status: status.as_u16(),
                message: text,
            });
        }

        let value: serde_json::Value = serde_json::from_str(&text)?;
        value["content"]
            .as_array()
            .into_iter()
            .flatten()
            .find_map(|part| part["text"].as_str())
            .map(str::to_string)
            .ok_or_else(|| ScribeError::Other("anthropic response had no text content".into()))
    }
}

// ---------------------------------------------------------------------------
// TemplateComposer: offline fill-in
// ---------------------------------------------------------------------------

/// Fills placeholders directly from the submission, without a model.
///
/// Name-like placeholders get the recipient name; research placeholders get
/// the most relevant paper title when one was found; everything else gets the
/// recipient's stated interest.
pub struct TemplateComposer {
    placeholder: Regex,
}

impl TemplateComposer {
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"),
        }
    }
}

impl Default for TemplateComposer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Composer for TemplateComposer {
    fn name(&self) -> &str {
        "template"
    }

    async fn compose(&self, request: &ComposeRequest) -> Result<String> {
        let filled = self.placeholder.replace_all(&request.template, |caps: &regex::Captures| {
            let key = caps[1].trim().to_lowercase();
            if key.contains("name") {
                request.recipient_name.clone()
            } else if key.contains("research") || key.contains("paper") || key.contains("publication") {
                request
                    .papers
                    .first()
                    .map(|p| p.title.clone())
                    .unwrap_or_else(|| request.recipient_interest.clone())
            } else {
                request.recipient_interest.clone()
            }
        });
        Ok(filled.into_owned())
    }
}

// ---------------------------------------------------------------------------
// EmailComposerStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedEmail {
    pub body: String,
    pub recipient_name: String,
    pub composer: String,
    pub template_type: TemplateType,
    pub word_count: usize,
    pub attempts: u32,
}

pub struct EmailComposerStep {
    composer: Arc<dyn Composer>,
    max_attempts: u32,
    leftover: Regex,
    blank_lines: Regex,
}

impl EmailComposerStep {
    pub fn new(composer: Arc<dyn Composer>) -> Self {
        Self {
            composer,
            max_attempts: 3,
            leftover: Regex::new(r"\{\{[^}]+\}\}").expect("placeholder pattern is valid"),
            blank_lines: Regex::new(r"\n\s*\n\s*\n+").expect("blank line pattern is valid"),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn clean(&self, raw: &str) -> String {
        self.blank_lines.replace_all(raw.trim(), "\n\n").into_owned()
    }

    /// Blocking problems with a draft. Empty means usable.
    fn issues(&self, body: &str) -> Vec<String> {
        let mut issues = Vec::new();
        if body.is_empty() {
            issues.push("email body is empty".to_string());
        }
        if self.leftover.is_match(body) {
            issues.push("email contains unfilled placeholders".to_string());
        }
        issues
    }
}

#[async_trait]
impl PipelineStep for EmailComposerStep {
    fn kind(&self) -> StepKind {
        StepKind::EmailComposer
    }

    async fn execute(
        &self,
        context: &PipelineContext,
    ) -> std::result::Result<StepOutput, StepError> {
        let analysis: TemplateAnalysis = context.require(StepKind::TemplateParser)?;
        let web: WebContent = context.require(StepKind::WebScraper)?;
        let papers = context
            .output_as::<Enrichment>(StepKind::ArxivHelper)?
            .map(|e| e.papers)
            .unwrap_or_default();

        let submission = context.submission();
        let request = ComposeRequest {
            recipient_name: submission.recipient_name.trim().to_string(),
            recipient_interest: submission.recipient_interest.trim().to_string(),
            template: submission.template.clone(),
            template_type: analysis.template_type,
            web_content: web.content,
            papers,
        };

        let mut last_error = StepError::Other("composer produced nothing".into());
        for attempt in 1..=self.max_attempts {
            let raw = match self.composer.compose(&request).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(item_id = %context.item_id(), attempt, error = %e, "Composition attempt failed");
                    last_error = e.into();
                    continue;
                }
            };

            let body = self.clean(&raw);
            let issues = self.issues(&body);
            if !issues.is_empty() {
                tracing::warn!(item_id = %context.item_id(), attempt, issues = ?issues, "Draft rejected");
                last_error = StepError::InvalidInput(issues.join("; "));
                continue;
            }

            let email = ComposedEmail {
                word_count: body.split_whitespace().count(),
                body,
                recipient_name: request.recipient_name.clone(),
                composer: self.composer.name().to_string(),
                template_type: request.template_type,
                attempts: attempt,
            };
            let output = serde_json::to_value(&email)
                .map_err(|e| StepError::Other(format!("serialize email: {e}")))?;
            return Ok(StepOutput::Produced(output));
        }
        Err(last_error)
    }
}
