//! The production steps of the outreach pipeline and the clients they call.

pub mod arxiv_helper;
pub mod email_composer;
pub mod template_parser;
pub mod web_scraper;

pub use arxiv_helper::{ArxivClient, ArxivHelperStep, Enrichment, OfflinePaperSource, Paper, PaperSource};
pub use email_composer::{
    AnthropicComposer, ComposeRequest, ComposedEmail, Composer, EmailComposerStep,
    TemplateComposer,
};
pub use template_parser::{TemplateAnalysis, TemplateParserStep, TemplateType};
pub use web_scraper::{
    GoogleSearchClient, OfflineSearchClient, SearchClient, SearchHit, WebContent, WebScraperStep,
};

use std::sync::Arc;

use scribe_types::Result;

use crate::step::Pipeline;

/// Assemble the four production steps in their fixed order.
pub fn standard_pipeline(
    search: Arc<dyn SearchClient>,
    papers: Arc<dyn PaperSource>,
    composer: Arc<dyn Composer>,
) -> Result<Pipeline> {
    Pipeline::builder()
        .step(TemplateParserStep::new())
        .step(WebScraperStep::new(search))
        .step(ArxivHelperStep::new(papers))
        .step(EmailComposerStep::new(composer))
        .build()
}
