//! Academic enrichment: recent papers by the recipient, research templates only.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use scribe_types::{Result, ScribeError, StepError};

use crate::context::PipelineContext;
use crate::step::{PipelineStep, StepKind, StepOutput};
use crate::steps::template_parser::{TemplateAnalysis, TemplateType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub year: Option<i32>,
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn papers_by(&self, author: &str, limit: usize) -> Result<Vec<Paper>>;
}

// ---------------------------------------------------------------------------
// ArxivClient
// ---------------------------------------------------------------------------

/// arXiv export API client. Reads the Atom feed with a handful of patterns.
#[derive(Debug)]
pub struct ArxivClient {
    client: reqwest::Client,
    base_url: String,
    entry: Regex,
    title: Regex,
    summary: Regex,
    id: Regex,
    published: Regex,
}

impl ArxivClient {
    pub fn new() -> Self {
        let re = |p: &str| Regex::new(p).expect("atom pattern is valid");
        Self {
            client: reqwest::Client::new(),
            base_url: "http://export.arxiv.org".to_string(),
            entry: re(r"(?s)<entry>(.*?)</entry>"),
            title: re(r"(?s)<title>(.*?)</title>"),
            summary: re(r"(?s)<summary>(.*?)</summary>"),
            id: re(r"<id>(.*?)</id>"),
            published: re(r"<published>(\d{4})"),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Pull papers out of an Atom feed body.
    pub fn parse_feed(&self, body: &str) -> Vec<Paper> {
        let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        self.entry
            .captures_iter(body)
            .filter_map(|entry| {
                let entry = entry.get(1)?.as_str();
                let capture = |re: &Regex| re.captures(entry).and_then(|c| c.get(1)).map(|m| m.as_str());
                Some(Paper {
                    title: squash(capture(&self.title)?),
                    summary: squash(capture(&self.summary).unwrap_or_default()),
                    url: capture(&self.id).unwrap_or_default().trim().to_string(),
                    year: capture(&self.published).and_then(|y| y.parse().ok()),
                })
            })
            .collect()
    }
}

impl Default for ArxivClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    async fn papers_by(&self, author: &str, limit: usize) -> Result<Vec<Paper>> {
        let query = format!("au:\"{author}\"");
        let max = limit.to_string();
        let response = self
            .client
            .get(format!("{}/api/query", self.base_url))
            .query(&[
                ("search_query", query.as_str()),
                ("max_results", max.as_str()),
                ("sortBy", "submittedDate"),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(transport_error)?;
        if !status.is_success() {
            return Err(ScribeError::Http {
                service: "arxiv".into(),
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(self.parse_feed(&body))
    }
}

fn transport_error(e: reqwest::Error) -> ScribeError {
    ScribeError::Http {
        service: "arxiv".into(),
        status: 0,
        message: e.to_string(),
    }
}

/// Paper source for offline runs: finds nothing.
pub struct OfflinePaperSource;

#[async_trait]
impl PaperSource for OfflinePaperSource {
    async fn papers_by(&self, _author: &str, _limit: usize) -> Result<Vec<Paper>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// ArxivHelperStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub papers: Vec<Paper>,
    pub papers_found: usize,
}

pub struct ArxivHelperStep {
    source: Arc<dyn PaperSource>,
    max_papers_to_fetch: usize,
    top_n_papers: usize,
}

impl ArxivHelperStep {
    pub fn new(source: Arc<dyn PaperSource>) -> Self {
        Self {
            source,
            max_papers_to_fetch: 20,
            top_n_papers: 5,
        }
    }
}

/// Number of interest words that appear in the paper's title or summary.
fn relevance(paper: &Paper, interest: &str) -> usize {
    let text = format!("{} {}", paper.title, paper.summary).to_lowercase();
    interest
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2 && text.contains(*w))
        .count()
}

#[async_trait]
impl PipelineStep for ArxivHelperStep {
    fn kind(&self) -> StepKind {
        StepKind::ArxivHelper
    }

    async fn execute(
        &self,
        context: &PipelineContext,
    ) -> std::result::Result<StepOutput, StepError> {
        let analysis: TemplateAnalysis = context.require(StepKind::TemplateParser)?;
        if analysis.template_type != TemplateType::Research {
            return Ok(StepOutput::Skipped(format!(
                "{:?} template does not use papers",
                analysis.template_type
            )));
        }

        let submission = context.submission();
        let mut papers = self
            .source
            .papers_by(submission.recipient_name.trim(), self.max_papers_to_fetch)
            .await?;
        let papers_found = papers.len();

        // Stable sort keeps the source's recency order among equal scores.
        let interest = submission.recipient_interest.as_str();
        papers.sort_by_key(|p| std::cmp::Reverse(relevance(p, interest)));
        papers.truncate(self.top_n_papers);

        tracing::debug!(item_id = %context.item_id(), papers_found, kept = papers.len(), "Papers selected");
        let output = serde_json::to_value(Enrichment {
            papers,
            papers_found,
        })
        .map_err(|e| StepError::Other(format!("serialize enrichment: {e}")))?;
        Ok(StepOutput::Produced(output))
    }
}
