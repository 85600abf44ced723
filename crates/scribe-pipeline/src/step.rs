//! Step contract, dynamic dispatch wrapper, and the statically ordered pipeline.

use std::fmt;

use async_trait::async_trait;

use scribe_types::{Result, ScribeError, StepError};

use crate::context::PipelineContext;

// ---------------------------------------------------------------------------
// StepKind: the closed set of pipeline steps
// ---------------------------------------------------------------------------

/// Every step a pipeline can contain, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    /// Template analysis: classify the template and derive search terms.
    TemplateParser,
    /// Content discovery: web search over the derived terms.
    WebScraper,
    /// Domain enrichment: academic papers, research templates only.
    ArxivHelper,
    /// Final composition of the outreach message.
    EmailComposer,
}

impl StepKind {
    pub const ORDER: [StepKind; 4] = [
        StepKind::TemplateParser,
        StepKind::WebScraper,
        StepKind::ArxivHelper,
        StepKind::EmailComposer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::TemplateParser => "template_parser",
            StepKind::WebScraper => "web_scraper",
            StepKind::ArxivHelper => "arxiv_helper",
            StepKind::EmailComposer => "email_composer",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStep trait
// ---------------------------------------------------------------------------

/// What a step hands back to the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// The step ran and produced its designated output.
    Produced(serde_json::Value),
    /// The step does not apply to this item; the reason is kept for the audit trail.
    Skipped(String),
}

#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Which slot of the pipeline this step fills.
    fn kind(&self) -> StepKind;

    /// Execute against the context. Called at most once per context.
    async fn execute(&self, context: &PipelineContext) -> std::result::Result<StepOutput, StepError>;
}

// ---------------------------------------------------------------------------
// DynStep: object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynStep(Box<dyn PipelineStep>);

impl DynStep {
    pub fn new(step: impl PipelineStep + 'static) -> Self {
        Self(Box::new(step))
    }

    pub fn kind(&self) -> StepKind {
        self.0.kind()
    }

    pub async fn execute(
        &self,
        context: &PipelineContext,
    ) -> std::result::Result<StepOutput, StepError> {
        self.0.execute(context).await
    }
}

// ---------------------------------------------------------------------------
// Pipeline: steps in their predeclared order
// ---------------------------------------------------------------------------

pub struct Pipeline {
    steps: Vec<DynStep>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build a pipeline, rejecting any step list that is not exactly [`StepKind::ORDER`].
    pub fn new(steps: Vec<DynStep>) -> Result<Self> {
        let kinds: Vec<StepKind> = steps.iter().map(DynStep::kind).collect();
        if kinds != StepKind::ORDER {
            let expected: Vec<&str> = StepKind::ORDER.iter().map(StepKind::as_str).collect();
            let got: Vec<&str> = kinds.iter().map(StepKind::as_str).collect();
            return Err(ScribeError::Validation(format!(
                "pipeline steps must be [{}], got [{}]",
                expected.join(", "),
                got.join(", ")
            )));
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[DynStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    steps: Vec<DynStep>,
}

impl PipelineBuilder {
    pub fn step(mut self, step: impl PipelineStep + 'static) -> Self {
        self.steps.push(DynStep::new(step));
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        Pipeline::new(self.steps)
    }
}
