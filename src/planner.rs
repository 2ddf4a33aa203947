//! Plan source: asks a chat-completions model for a plan, or falls back to a
//! generic product-listing heuristic when no model is configured or it misbehaves.

use anyhow::{Result, anyhow};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::plan::{
    ExtractionField, PaginationKind, PaginationPolicy, PlanDocument, PlanStep, StepAction,
    WaitKind, WaitSpec,
};

const SYSTEM_PROMPT: &str = r#"You plan data extraction runs for a headless browser. Reply with ONE JSON object and nothing else:
{"steps": [...], "fields": [...], "pagination": {...}}

Steps run in order. Each step is {"action": ..., "target": ..., "value": ..., "wait": ...} where action is one of:
- "navigate" with "target" set to a URL
- "click" with "target" set to a CSS selector
- "fill" with "target" set to a CSS selector and "value" set to the text
- "wait" with "wait": {"kind": "network_idle" | "selector" | "delay", "selector": ..., "timeout_ms": 5000}
- "extract" (reads every field)

Fields are {"name": ..., "selector": ..., "attribute": null, "required": false}. Every field selector must match one element per record.
Pagination is {"kind": "click" | "scroll" | "none", "selector": ..., "max_pages": 1}. Click pagination needs a selector for the next-page control.
Start with a navigate step to the target and include exactly one extract step."#;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The part of a plan the model is asked to produce.
#[derive(Debug, Deserialize)]
struct GeneratedPlan {
    #[serde(default)]
    steps: Vec<PlanStep>,
    #[serde(default)]
    fields: Vec<ExtractionField>,
    #[serde(default)]
    pagination: PaginationPolicy,
}

pub struct PlanSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl PlanSource {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: settings.planner_base_url.clone(),
            api_key: settings.planner_api_key.clone(),
            model: settings.planner_model.clone(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Produce a plan for `target`. Never fails: any backend problem yields the heuristic plan.
    pub async fn generate_plan(&self, target: &str, objective: &str) -> PlanDocument {
        let Some(api_key) = self.api_key.as_deref() else {
            info!("no planner key configured, using heuristic plan");
            return heuristic_plan(target, objective);
        };
        match self.request_plan(api_key, target, objective).await {
            Ok(plan) => {
                info!(steps = plan.steps.len(), fields = plan.fields.len(), "plan generated");
                plan
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "plan generation failed, using heuristic plan");
                heuristic_plan(target, objective)
            }
        }
    }

    async fn request_plan(&self, api_key: &str, target: &str, objective: &str) -> Result<PlanDocument> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": format!("Target: {}\nObjective: {}", target, objective)},
                ],
                "temperature": 0.1,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await?;

        let status = response.status();
        let json_resp: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(anyhow!("planner API error ({}): {}", status, err_msg));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("no content in planner response"))?;
        debug!(content, "planner replied");

        let generated: GeneratedPlan = serde_json::from_str(strip_fences(content))
            .map_err(|e| anyhow!("planner reply is not a plan: {}", e))?;

        let plan = PlanDocument {
            target: target.to_string(),
            objective: objective.to_string(),
            steps: generated.steps,
            fields: generated.fields,
            pagination: generated.pagination,
        };
        plan.validate()?;
        if plan.fields.is_empty() || !plan.has_extract_step() {
            return Err(anyhow!("planner reply extracts nothing"));
        }
        Ok(plan)
    }
}

/// Models sometimes wrap JSON in markdown fences.
fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Generic product-listing plan: title, price and SKU columns.
pub fn heuristic_plan(target: &str, objective: &str) -> PlanDocument {
    let field = |name: &str, selector: &str| ExtractionField {
        name: name.to_string(),
        selector: selector.to_string(),
        attribute: None,
        required: false,
    };
    let step = |action: StepAction| PlanStep {
        action,
        target: None,
        value: None,
        wait: None,
    };

    PlanDocument {
        target: target.to_string(),
        objective: objective.to_string(),
        steps: vec![
            PlanStep {
                target: Some(target.to_string()),
                ..step(StepAction::Navigate)
            },
            PlanStep {
                wait: Some(WaitSpec {
                    kind: WaitKind::NetworkIdle,
                    selector: None,
                    timeout_ms: 5_000,
                }),
                ..step(StepAction::Wait)
            },
            step(StepAction::Extract),
        ],
        fields: vec![
            field("title", "h1, h2, .product-title"),
            field("price", ".price, [data-price]"),
            field("sku", "[data-sku], .sku, .product-sku"),
        ],
        pagination: PaginationPolicy {
            kind: PaginationKind::Scroll,
            selector: None,
            max_pages: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(key: Option<&str>, base_url: &str) -> PlanSource {
        let key = key.map(String::from);
        let settings = Settings::from_lookup(move |k| match k {
            "PLANNER_API_KEY" => key.clone(),
            _ => None,
        })
        .unwrap();
        PlanSource::new(&settings).with_base_url(base_url)
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn heuristic_plan_is_valid() {
        let plan = heuristic_plan("https://shop.example", "products");
        plan.validate().unwrap();
        assert_eq!(plan.field_names(), ["title", "price", "sku"]);
        assert_eq!(plan.steps[0].target.as_deref(), Some("https://shop.example"));
        assert_eq!(plan.pagination.kind, PaginationKind::Scroll);
        assert_eq!(plan.pagination.max_pages, 1);
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[tokio::test]
    async fn without_key_no_request_is_made() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let plan = source(None, &server.uri())
            .generate_plan("https://shop.example", "products")
            .await;
        assert_eq!(plan, heuristic_plan("https://shop.example", "products"));
    }

    #[tokio::test]
    async fn model_plan_is_used_when_valid() {
        let server = MockServer::start().await;
        let reply = r#"```json
{"steps": [{"action": "navigate", "target": "https://shop.example/lamps"}, {"action": "extract"}],
 "fields": [{"name": "name", "selector": ".card h3", "required": true}],
 "pagination": {"kind": "click", "selector": "a.next", "max_pages": 3}}
```"#;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"temperature": 0.1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(reply)))
            .expect(1)
            .mount(&server)
            .await;

        let plan = source(Some("sk-test"), &server.uri())
            .generate_plan("https://shop.example", "lamps")
            .await;
        assert_eq!(plan.target, "https://shop.example");
        assert_eq!(plan.objective, "lamps");
        assert_eq!(plan.field_names(), ["name"]);
        assert!(plan.fields[0].required);
        assert_eq!(plan.pagination.kind, PaginationKind::Click);
        assert_eq!(plan.pagination.max_pages, 3);
    }

    #[tokio::test]
    async fn falls_back_on_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": {"message": "bad key"}})),
            )
            .mount(&server)
            .await;

        let plan = source(Some("sk-test"), &server.uri())
            .generate_plan("https://shop.example", "products")
            .await;
        assert_eq!(plan, heuristic_plan("https://shop.example", "products"));
    }

    #[tokio::test]
    async fn falls_back_on_invalid_plan() {
        let server = MockServer::start().await;
        // Click pagination without a selector does not validate.
        let reply = r#"{"steps": [{"action": "extract"}], "fields": [{"name": "a", "selector": "p"}],
                        "pagination": {"kind": "click", "max_pages": 2}}"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(reply)))
            .mount(&server)
            .await;

        let plan = source(Some("sk-test"), &server.uri())
            .generate_plan("https://shop.example", "products")
            .await;
        assert_eq!(plan, heuristic_plan("https://shop.example", "products"));
    }
}
