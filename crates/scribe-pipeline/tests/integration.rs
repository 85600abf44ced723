//! End-to-end tests for the standard outreach pipeline.
//!
//! Each test assembles the four production steps against in-process clients,
//! runs one context through the runner, and checks the final email and the
//! progress trail.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use scribe_pipeline::{
    standard_pipeline, ComposedEmail, EventEmitter, NoopSink, OfflinePaperSource,
    OfflineSearchClient, Paper, PaperSource, PipelineContext, PipelineEvent, PipelineRunner,
    ProgressEvent, ProgressSink, SearchClient, SearchHit, TemplateComposer,
};
use scribe_types::{Result, ScribeError, StepError, StepStatus, Submission};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct StaticSearch;

#[async_trait]
impl SearchClient for StaticSearch {
    async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        Ok(vec![SearchHit {
            title: format!("Results for {query}"),
            url: format!("https://example.org/{}", query.replace(' ', "-")),
            snippet: "Professor of robotics".into(),
        }])
    }
}

struct DownSearch;

#[async_trait]
impl SearchClient for DownSearch {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        Err(ScribeError::Http {
            service: "google_search".into(),
            status: 503,
            message: "backend unavailable".into(),
        })
    }
}

struct StaticPapers;

#[async_trait]
impl PaperSource for StaticPapers {
    async fn papers_by(&self, _author: &str, _limit: usize) -> Result<Vec<Paper>> {
        Ok(vec![Paper {
            title: "Learning Dexterous Robot Control".into(),
            summary: "Robot control with reinforcement learning.".into(),
            url: "http://arxiv.org/abs/2401.00001".into(),
            year: Some(2024),
        }])
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<ProgressEvent>>);

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn report(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn context(template: &str) -> PipelineContext {
    PipelineContext::new(
        Uuid::new_v4(),
        "user-1",
        Submission {
            recipient_name: "Dr. Jane Smith".into(),
            recipient_interest: "robot control".into(),
            template: template.into(),
        },
    )
}

// ---------------------------------------------------------------------------
// Test 1: Research template runs every step and cites a paper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn research_template_runs_all_four_steps() {
    let pipeline = standard_pipeline(
        Arc::new(StaticSearch),
        Arc::new(StaticPapers),
        Arc::new(TemplateComposer::new()),
    )
    .expect("standard pipeline is well ordered");
    let runner = PipelineRunner::new(pipeline);
    let sink = RecordingSink::default();

    let result = runner
        .run(context("Hi {{name}}, I read your paper on {{research}}."), &sink)
        .await
        .expect("pipeline should succeed");

    let email: ComposedEmail = serde_json::from_value(result.output).unwrap();
    assert_eq!(
        email.body,
        "Hi Dr. Jane Smith, I read your paper on Learning Dexterous Robot Control."
    );

    let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Succeeded; 4]);

    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 8);
    assert_eq!(events[0].step, "template_parser");
    assert_eq!(events[0].status, StepStatus::Started);
    assert_eq!(events[7].step, "email_composer");
    assert_eq!(events[7].status, StepStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Test 2: General template skips enrichment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn general_template_skips_arxiv_helper() {
    let pipeline = standard_pipeline(
        Arc::new(OfflineSearchClient),
        Arc::new(OfflinePaperSource),
        Arc::new(TemplateComposer::new()),
    )
    .unwrap();
    let runner = PipelineRunner::new(pipeline);

    let result = runner
        .run(context("Hello {{name}}, hope you are well."), &NoopSink)
        .await
        .expect("pipeline should succeed");

    assert_eq!(result.steps[2].step, "arxiv_helper");
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert_eq!(result.timings_ms().len(), 4);
}

// ---------------------------------------------------------------------------
// Test 3: A failing search aborts the run before composition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_outage_aborts_at_web_scraper() {
    let pipeline = standard_pipeline(
        Arc::new(DownSearch),
        Arc::new(StaticPapers),
        Arc::new(TemplateComposer::new()),
    )
    .unwrap();
    let runner = PipelineRunner::new(pipeline);
    let sink = RecordingSink::default();

    let err = runner
        .run(context("Hi {{name}}, loved your research."), &sink)
        .await
        .expect_err("pipeline should fail");

    assert_eq!(err.step, "web_scraper");
    assert!(matches!(err.source, StepError::External { ref service, .. } if service == "google_search"));
    assert_eq!(err.steps.len(), 2);

    let events = sink.0.lock().unwrap();
    assert!(events.iter().all(|e| e.step != "arxiv_helper" && e.step != "email_composer"));
    assert_eq!(events.last().map(|e| e.status), Some(StepStatus::Failed));

    let scribe_err: ScribeError = err.into();
    assert!(scribe_err.to_string().starts_with("Step 'web_scraper' failed"));
}

// ---------------------------------------------------------------------------
// Test 4: EventEmitter relays step progress to subscribers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_emitter_relays_progress() {
    let emitter = EventEmitter::new(64);
    let mut rx = emitter.subscribe();
    let runner = PipelineRunner::new(
        standard_pipeline(
            Arc::new(OfflineSearchClient),
            Arc::new(OfflinePaperSource),
            Arc::new(TemplateComposer::new()),
        )
        .unwrap(),
    );

    runner
        .run(context("Hello {{name}}, hope you are well."), &emitter)
        .await
        .unwrap();

    let mut step_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let PipelineEvent::Step(_) = event {
            step_events += 1;
        }
    }
    assert_eq!(step_events, 8);
}
