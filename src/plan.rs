use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::PlanError;

/// Default bound for a `wait` step when the plan omits one.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5_000;

/// One instruction in a plan. Which optional fields matter depends on `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Navigate,
    Click,
    Fill,
    Wait,
    Extract,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::Click => "click",
            StepAction::Fill => "fill",
            StepAction::Wait => "wait",
            StepAction::Extract => "extract",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    #[default]
    NetworkIdle,
    Selector,
    Delay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    #[serde(default, alias = "type")]
    pub kind: WaitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default = "default_wait_timeout")]
    pub timeout_ms: u64,
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self {
            kind: WaitKind::NetworkIdle,
            selector: None,
            timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

/// A named extraction rule contributing one output column.
///
/// `attribute` absent means the element's text content is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionField {
    pub name: String,
    pub selector: String,
    #[serde(default, alias = "attr", skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationKind {
    Click,
    Scroll,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationPolicy {
    #[serde(default, alias = "type")]
    pub kind: PaginationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            kind: PaginationKind::None,
            selector: None,
            max_pages: 1,
        }
    }
}

/// The unit of work handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(alias = "url")]
    pub target: String,
    #[serde(default, alias = "goal")]
    pub objective: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub fields: Vec<ExtractionField>,
    #[serde(default)]
    pub pagination: PaginationPolicy,
}

impl PlanDocument {
    /// Decode and validate a plan in one go.
    pub fn from_json(raw: &str) -> Result<Self, PlanError> {
        let plan: PlanDocument = serde_json::from_str(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json_pretty(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Structural checks only. Steps with missing optional inputs are left
    /// for the engine to skip.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.target.trim().is_empty() {
            return Err(PlanError::EmptyTarget);
        }

        let mut seen = HashSet::new();
        for (index, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(PlanError::EmptyField {
                    index,
                    what: "name",
                });
            }
            if field.selector.trim().is_empty() {
                return Err(PlanError::EmptyField {
                    index,
                    what: "selector",
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(PlanError::DuplicateField(field.name.clone()));
            }
        }

        if self.pagination.max_pages == 0 {
            return Err(PlanError::ZeroPages);
        }
        if self.pagination.kind == PaginationKind::Click
            && self
                .pagination
                .selector
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
        {
            return Err(PlanError::MissingPaginationSelector);
        }

        Ok(())
    }

    pub fn has_extract_step(&self) -> bool {
        self.steps.iter().any(|s| s.action == StepAction::Extract)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

fn default_wait_timeout() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

fn default_max_pages() -> u32 {
    1
}
