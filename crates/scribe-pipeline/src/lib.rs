//! Ordered step pipeline for outreach generation.
//!
//! This crate implements the pipeline side of Scribe: the shared
//! [`PipelineContext`], the [`PipelineStep`] contract over the closed
//! [`StepKind`] set, the sequential [`PipelineRunner`], progress reporting,
//! and the four production steps with their external-service clients.

pub mod context;
pub mod events;
pub mod runner;
pub mod step;
pub mod steps;

pub use context::{PipelineContext, StepRecord};
pub use events::{EventEmitter, NoopSink, PipelineEvent, ProgressEvent, ProgressSink};
pub use runner::{FinalResult, PipelineError, PipelineRunner};
pub use step::{DynStep, Pipeline, PipelineBuilder, PipelineStep, StepKind, StepOutput};
pub use steps::{
    standard_pipeline, AnthropicComposer, ArxivClient, ArxivHelperStep, ComposeRequest,
    ComposedEmail, Composer, EmailComposerStep, Enrichment, GoogleSearchClient,
    OfflinePaperSource, OfflineSearchClient, Paper, PaperSource, SearchClient, SearchHit,
    TemplateAnalysis, TemplateComposer, TemplateParserStep, TemplateType, WebContent,
    WebScraperStep,
};
