//! Prompt templates for classification and strategic rollups.

use crate::error::Result;

use anyhow::Context as _;
use minijinja::Environment;
use serde::Serialize;

const CLASSIFY_SYSTEM: &str = r#"You analyse constituent communications sent to an elected official's office.
Return ONLY a JSON object with exactly this shape:
{
  "sentiment": {"score": <number -1.0..1.0>, "label": "positive" | "neutral" | "negative", "reasoning": "<one sentence>"},
  "categories": {"primary": "<category>", "secondary": ["<category>", ...]},
  "priority": {"score": <integer 1..5>, "reasoning": "<one sentence>"},
  "entities": {"locations": [], "organizations": [], "people": [], "issues": []},
  "intentions": ["<what the sender wants>", ...],
  "summary": "<two sentences at most>",
  "confidence": <number 0.0..1.0>
}

Priority scale:
5 = critical: threats to life or public safety, emergencies
4 = high: state-wide impact, urgent policy matters, large groups affected
3 = moderate: local issues affecting a community or neighbourhood
2 = routine: standard requests, casework, general feedback
1 = low: non-urgent, informational, thank-you notes

Sentiment reflects the substance of the message, not its politeness. A courteous
message reporting a serious failure is negative; a blunt message expressing
thanks or support is positive.

Use short lowercase category names such as: {{ categories | join(", ") }}."#;

const CLASSIFY_USER: &str = r#"Channel: {{ kind }}
From: {{ sender }}
Subject: {{ subject or "(none)" }}

Content:
{{ content }}"#;

const ROLLUP_SYSTEM: &str = r#"You are a strategic advisor producing a situation report from classified constituent communications.
Return ONLY a JSON object with exactly this shape:
{
  "situationOverview": "<one paragraph>",
  "criticalIssues": [
    {"category": "<category from the input>", "description": "<what is happening>", "urgency": "critical" | "high" | "medium" | "low", "affectedArea": "<place or group>", "count": <integer>}
  ],
  "recommendedActions": ["<action>", ...],
  "monitoringPriorities": ["<what to watch>", ...]
}
Only reference categories that appear in the input. Weight categories by their share of high-priority communications."#;

const ROLLUP_USER: &str = r#"Communications by category (last {{ window_days }} days):
{% for category in categories -%}
- {{ category.name }}: {{ category.count }} communications, {{ (category.priority_weight * 100) | round | int }}% high priority
{% endfor %}
High-priority communications:
{% for item in high_priority -%}
- [{{ item.category }}] priority {{ item.priority }}, {{ item.sentiment }}: {{ item.summary }}
{% else -%}
- none
{% endfor %}"#;

/// Default category vocabulary offered to the classifier.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "infrastructure",
    "public safety",
    "healthcare",
    "education",
    "environment",
    "economy",
    "housing",
    "transportation",
    "taxes",
    "social services",
    "constituent services",
    "other",
];

#[derive(Debug, Serialize)]
pub struct CategoryPromptRow<'a> {
    pub name: &'a str,
    pub count: usize,
    pub priority_weight: f64,
}

#[derive(Debug, Serialize)]
pub struct HighPriorityPromptRow<'a> {
    pub category: &'a str,
    pub priority: i64,
    pub sentiment: &'a str,
    pub summary: &'a str,
}

/// Compiled prompt templates.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("classify_system", CLASSIFY_SYSTEM),
            ("classify_user", CLASSIFY_USER),
            ("rollup_system", ROLLUP_SYSTEM),
            ("rollup_user", ROLLUP_USER),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("failed to compile prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    fn render(&self, name: &str, context: minijinja::Value) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(context))
            .with_context(|| format!("failed to render prompt template {name}"))?;
        Ok(rendered)
    }

    pub fn classify_system(&self) -> Result<String> {
        self.render(
            "classify_system",
            minijinja::context! { categories => DEFAULT_CATEGORIES },
        )
    }

    pub fn classify_user(
        &self,
        kind: &str,
        sender: &str,
        subject: Option<&str>,
        content: &str,
    ) -> Result<String> {
        self.render(
            "classify_user",
            minijinja::context! {
                kind => kind,
                sender => sender,
                subject => subject,
                content => content,
            },
        )
    }

    pub fn rollup_system(&self) -> Result<String> {
        self.render("rollup_system", minijinja::context! {})
    }

    pub fn rollup_user(
        &self,
        window_days: i64,
        categories: &[CategoryPromptRow<'_>],
        high_priority: &[HighPriorityPromptRow<'_>],
    ) -> Result<String> {
        self.render(
            "rollup_user",
            minijinja::context! {
                window_days => window_days,
                categories => categories,
                high_priority => high_priority,
            },
        )
    }
}
