//! Template analysis: placeholders, template category, and search terms.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use scribe_types::StepError;

use crate::context::PipelineContext;
use crate::step::{PipelineStep, StepKind, StepOutput};

/// Category of a template, deciding which enrichment applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    Research,
    Book,
    General,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateAnalysis {
    pub template_type: TemplateType,
    /// Unique `{{placeholder}}` tokens in order of first appearance.
    pub placeholders: Vec<String>,
    /// One or two search queries for content discovery.
    pub search_terms: Vec<String>,
}

const RESEARCH_KEYWORDS: &[&str] = &[
    "research", "paper", "publication", "study", "studies", "lab", "arxiv", "thesis", "journal",
];
const BOOK_KEYWORDS: &[&str] = &["book", "novel", "author", "chapter", "memoir", "wrote"];

pub struct TemplateParserStep {
    placeholder: Regex,
}

impl TemplateParserStep {
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(r"\{\{[^}]+\}\}").expect("placeholder pattern is valid"),
        }
    }

    pub fn extract_placeholders(&self, template: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for m in self.placeholder.find_iter(template) {
            let token = m.as_str().to_string();
            if !seen.contains(&token) {
                seen.push(token);
            }
        }
        seen
    }

    /// Keyword vote over the template text. Ties between research and book go to research.
    pub fn classify(&self, template: &str) -> TemplateType {
        let lower = template.to_lowercase();
        let score = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count();
        let research = score(RESEARCH_KEYWORDS);
        let book = score(BOOK_KEYWORDS);
        match (research, book) {
            (0, 0) => TemplateType::General,
            (r, b) if r >= b => TemplateType::Research,
            _ => TemplateType::Book,
        }
    }

    pub fn search_terms(&self, name: &str, interest: &str, kind: TemplateType) -> Vec<String> {
        let second = match kind {
            TemplateType::Research => format!("{name} publications"),
            TemplateType::Book => format!("{name} books"),
            TemplateType::General => name.to_string(),
        };
        vec![format!("{name} {interest}"), second]
    }
}

impl Default for TemplateParserStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStep for TemplateParserStep {
    fn kind(&self) -> StepKind {
        StepKind::TemplateParser
    }

    async fn execute(&self, context: &PipelineContext) -> Result<StepOutput, StepError> {
        let submission = context.submission();
        let name = submission.recipient_name.trim();
        let interest = submission.recipient_interest.trim();
        if name.is_empty() {
            return Err(StepError::InvalidInput("recipient_name is missing".into()));
        }
        if interest.is_empty() {
            return Err(StepError::InvalidInput("recipient_interest is missing".into()));
        }
        if submission.template.trim().is_empty() {
            return Err(StepError::InvalidInput("template is empty".into()));
        }

        let template_type = self.classify(&submission.template);
        let analysis = TemplateAnalysis {
            template_type,
            placeholders: self.extract_placeholders(&submission.template),
            search_terms: self.search_terms(name, interest, template_type),
        };
        tracing::debug!(
            item_id = %context.item_id(),
            template_type = ?analysis.template_type,
            placeholders = analysis.placeholders.len(),
            "Template analysed"
        );

        let output = serde_json::to_value(&analysis)
            .map_err(|e| StepError::Other(format!("serialize analysis: {e}")))?;
        Ok(StepOutput::Produced(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_types::Submission;
    use uuid::Uuid;

    fn context(template: &str, name: &str) -> PipelineContext {
        PipelineContext::new(
            Uuid::new_v4(),
            "user-1",
            Submission {
                recipient_name: name.into(),
                recipient_interest: "machine learning".into(),
                template: template.into(),
            },
        )
    }

    #[test]
    fn placeholders_are_unique_and_ordered() {
        let step = TemplateParserStep::new();
        assert_eq!(
            step.extract_placeholders("Hi {{name}}, I loved {{research}}! Bye {{name}}"),
            vec!["{{name}}", "{{research}}"]
        );
    }

    #[test]
    fn classification_by_keywords() {
        let step = TemplateParserStep::new();
        assert_eq!(
            step.classify("I read your paper on {{research}}"),
            TemplateType::Research
        );
        assert_eq!(
            step.classify("Your book on {{topic}} changed how I think"),
            TemplateType::Book
        );
        assert_eq!(
            step.classify("Hello {{name}}, hope you are well"),
            TemplateType::General
        );
    }

    #[test]
    fn search_terms_depend_on_category() {
        let step = TemplateParserStep::new();
        assert_eq!(
            step.search_terms("Jane Smith", "robotics", TemplateType::Research),
            vec!["Jane Smith robotics", "Jane Smith publications"]
        );
        assert_eq!(
            step.search_terms("Jane Smith", "poetry", TemplateType::Book)[1],
            "Jane Smith books"
        );
    }

    #[tokio::test]
    async fn execute_produces_analysis() {
        let step = TemplateParserStep::new();
        let ctx = context("Hey {{name}}, I loved your research on {{research}}!", "Dr. Jane Smith");

        let out = step.execute(&ctx).await.unwrap();
        let StepOutput::Produced(value) = out else {
            panic!("expected produced output");
        };
        let analysis: TemplateAnalysis = serde_json::from_value(value).unwrap();
        assert_eq!(analysis.template_type, TemplateType::Research);
        assert_eq!(analysis.placeholders, vec!["{{name}}", "{{research}}"]);
        assert_eq!(analysis.search_terms[0], "Dr. Jane Smith machine learning");
    }

    #[tokio::test]
    async fn execute_rejects_blank_recipient() {
        let step = TemplateParserStep::new();
        let ctx = context("Hey {{name}}", "   ");
        let err = step.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(_)));
    }
}
