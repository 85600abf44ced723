//! Content discovery: run the analysed search terms through a search client.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use scribe_types::{Result, ScribeError, StepError};

use crate::context::PipelineContext;
use crate::step::{PipelineStep, StepKind, StepOutput};
use crate::steps::template_parser::TemplateAnalysis;

// ---------------------------------------------------------------------------
// SearchClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Google Custom Search JSON API.
#[derive(Debug)]
pub struct GoogleSearchClient {
    client: reqwest::Client,
    api_key: String,
    cse_id: String,
    base_url: String,
}

impl GoogleSearchClient {
    pub fn new(api_key: String, cse_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            cse_id,
            base_url: "https://www.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    /// Reads `GOOGLE_API_KEY` and `GOOGLE_CSE_ID`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| ScribeError::Validation("GOOGLE_API_KEY is not set".into()))?;
        let cse = std::env::var("GOOGLE_CSE_ID")
            .map_err(|_| ScribeError::Validation("GOOGLE_CSE_ID is not set".into()))?;
        Ok(Self::new(key, cse))
    }
}

fn transport_error(e: reqwest::Error) -> ScribeError {
    ScribeError::Http {
        service: "google_search".into(),
        status: 0,
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Deserialize)]
struct GoogleItem {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl SearchClient for GoogleSearchClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let num = limit.clamp(1, 10).to_string();
        let response = self
            .client
            .get(format!("{}/customsearch/v1", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ScribeError::Http {
                service: "google_search".into(),
                status: status.as_u16(),
                message,
            });
        }

        let body: GoogleResponse = response
            .json()
            .await
            .map_err(transport_error)?;
        Ok(body
            .items
            .into_iter()
            .take(limit)
            .map(|item| SearchHit {
                title: item.title,
                url: item.link,
                snippet: item.snippet,
            })
            .collect())
    }
}

/// Search client for offline runs: finds nothing.
pub struct OfflineSearchClient;

#[async_trait]
impl SearchClient for OfflineSearchClient {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// WebScraperStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebContent {
    /// Condensed text handed to composition, capped at `max_content_chars`.
    pub content: String,
    pub urls: Vec<String>,
    pub queries_tried: usize,
    pub queries_failed: usize,
}

pub struct WebScraperStep {
    client: Arc<dyn SearchClient>,
    results_per_query: usize,
    max_content_chars: usize,
}

impl WebScraperStep {
    pub fn new(client: Arc<dyn SearchClient>) -> Self {
        Self {
            client,
            results_per_query: 3,
            max_content_chars: 5000,
        }
    }

    pub fn with_max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max;
        self
    }
}

#[async_trait]
impl PipelineStep for WebScraperStep {
    fn kind(&self) -> StepKind {
        StepKind::WebScraper
    }

    async fn execute(
        &self,
        context: &PipelineContext,
    ) -> std::result::Result<StepOutput, StepError> {
        let analysis: TemplateAnalysis = context.require(StepKind::TemplateParser)?;
        if analysis.search_terms.is_empty() {
            return Err(StepError::InvalidInput("no search terms to run".into()));
        }

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        for query in &analysis.search_terms {
            match self.client.search(query, self.results_per_query).await {
                Ok(found) => {
                    for hit in found {
                        if !hits.iter().any(|h| h.url == hit.url) {
                            hits.push(hit);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(item_id = %context.item_id(), query = %query, error = %e, "Search query failed");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if failed == analysis.search_terms.len() {
            return Err(last_error
                .map(StepError::from)
                .unwrap_or_else(|| StepError::Other("all search queries failed".into())));
        }

        let mut content = hits
            .iter()
            .map(|h| format!("{}: {}", h.title, h.snippet))
            .collect::<Vec<_>>()
            .join("\n");
        if content.chars().count() > self.max_content_chars {
            content = content.chars().take(self.max_content_chars).collect();
        }

        let web = WebContent {
            content,
            urls: hits.into_iter().map(|h| h.url).collect(),
            queries_tried: analysis.search_terms.len(),
            queries_failed: failed,
        };
        let output = serde_json::to_value(&web)
            .map_err(|e| StepError::Other(format!("serialize web content: {e}")))?;
        Ok(StepOutput::Produced(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::template_parser::TemplateType;
    use scribe_types::{StepResult, Submission};
    use std::time::Duration;
    use uuid::Uuid;

    struct FixedSearch {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl SearchClient for FixedSearch {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            if self.fail_on.map_or(false, |q| q == query) {
                return Err(ScribeError::Http {
                    service: "google_search".into(),
                    status: 503,
                    message: "unavailable".into(),
                });
            }
            Ok(vec![
                SearchHit {
                    title: format!("{query} homepage"),
                    url: "https://example.edu/jane".into(),
                    snippet: "Faculty page".into(),
                },
                SearchHit {
                    title: query.to_string(),
                    url: format!("https://example.edu/{}", query.len()),
                    snippet: "More".into(),
                },
            ])
        }
    }

    fn context_with_terms(terms: &[&str]) -> PipelineContext {
        let mut ctx = PipelineContext::new(
            Uuid::new_v4(),
            "user-1",
            Submission {
                recipient_name: "Jane Smith".into(),
                recipient_interest: "robotics".into(),
                template: "Hi {{name}}".into(),
            },
        );
        let analysis = TemplateAnalysis {
            template_type: TemplateType::General,
            placeholders: vec!["{{name}}".into()],
            search_terms: terms.iter().map(|s| s.to_string()).collect(),
        };
        ctx.record(
            StepKind::TemplateParser,
            &StepResult::succeeded(
                "template_parser",
                serde_json::to_value(analysis).unwrap(),
                Duration::ZERO,
            ),
        );
        ctx
    }

    fn web_content(out: StepOutput) -> WebContent {
        match out {
            StepOutput::Produced(v) => serde_json::from_value(v).unwrap(),
            StepOutput::Skipped(r) => panic!("unexpected skip: {r}"),
        }
    }

    #[tokio::test]
    async fn deduplicates_urls_across_queries() {
        let step = WebScraperStep::new(Arc::new(FixedSearch { fail_on: None }));
        let ctx = context_with_terms(&["Jane Smith robotics", "Jane Smith"]);

        let web = web_content(step.execute(&ctx).await.unwrap());
        assert_eq!(web.queries_tried, 2);
        assert_eq!(web.queries_failed, 0);
        assert_eq!(web.urls.len(), 3);
        assert!(web.content.contains("Faculty page"));
    }

    #[tokio::test]
    async fn partial_failure_still_produces_content() {
        let step = WebScraperStep::new(Arc::new(FixedSearch {
            fail_on: Some("Jane Smith"),
        }));
        let ctx = context_with_terms(&["Jane Smith robotics", "Jane Smith"]);

        let web = web_content(step.execute(&ctx).await.unwrap());
        assert_eq!(web.queries_failed, 1);
        assert!(!web.urls.is_empty());
    }

    #[tokio::test]
    async fn total_failure_is_an_external_error() {
        let step = WebScraperStep::new(Arc::new(FixedSearch {
            fail_on: Some("Jane Smith"),
        }));
        let ctx = context_with_terms(&["Jane Smith"]);

        let err = step.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, StepError::External { ref service, .. } if service == "google_search"));
    }

    #[tokio::test]
    async fn content_is_capped() {
        let step = WebScraperStep::new(Arc::new(FixedSearch { fail_on: None }))
            .with_max_content_chars(10);
        let ctx = context_with_terms(&["Jane Smith robotics"]);

        let web = web_content(step.execute(&ctx).await.unwrap());
        assert_eq!(web.content.chars().count(), 10);
    }

    #[tokio::test]
    async fn requires_template_analysis() {
        let step = WebScraperStep::new(Arc::new(OfflineSearchClient));
        let ctx = PipelineContext::new(
            Uuid::new_v4(),
            "user-1",
            Submission {
                recipient_name: "Jane".into(),
                recipient_interest: "x".into(),
                template: "y".into(),
            },
        );
        let err = step.execute(&ctx).await.unwrap_err();
        assert_eq!(err, StepError::MissingOutput("template_parser".into()));
    }
}
