//! Structured phase outputs (plan, checklist, summary) and their markdown
//! renderings. Models are asked for JSON; when they answer in prose the
//! `from_text` constructors salvage what they can.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::util::parse_json_response;

// ── Plan ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid complexity: {}", s)),
        }
    }
}

fn lenient_complexity<'de, D: Deserializer<'de>>(d: D) -> Result<Complexity, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub title: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub proposed_approach: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default, deserialize_with = "lenient_complexity")]
    pub estimated_complexity: Complexity,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl Plan {
    /// Parse a model response: JSON first, prose fallback.
    pub fn parse(text: &str, feature_request: &str) -> Plan {
        parse_json_response::<Plan>(text)
            .filter(|plan| !plan.title.trim().is_empty())
            .unwrap_or_else(|| Plan::from_text(text, feature_request))
    }

    pub fn from_text(text: &str, feature_request: &str) -> Plan {
        let title = first_heading(text).unwrap_or_else(|| one_line(feature_request, 80));
        Plan {
            title,
            problem_statement: feature_request.trim().to_string(),
            proposed_approach: text.trim().to_string(),
            affected_files: backticked_paths(text),
            estimated_complexity: Complexity::default(),
            risks: Vec::new(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut md = format!("# {}\n\n", self.title);
        md.push_str(&format!("## Problem Statement\n{}\n\n", self.problem_statement));
        md.push_str(&format!("## Proposed Approach\n{}\n\n", self.proposed_approach));
        md.push_str("## Affected Files\n");
        for file in &self.affected_files {
            md.push_str(&format!("- `{}`\n", file));
        }
        md.push_str(&format!(
            "\n## Estimated Complexity\n{}\n",
            self.estimated_complexity.as_str()
        ));
        if !self.risks.is_empty() {
            md.push_str("\n## Risks\n");
            for risk in &self.risks {
                md.push_str(&format!("- {}\n", risk));
            }
        }
        md
    }
}

// ── Checklist ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecklistAction {
    Create,
    #[default]
    Modify,
    Delete,
    Test,
}

impl ChecklistAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Test => "test",
        }
    }
}

impl FromStr for ChecklistAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "add" => Ok(Self::Create),
            "modify" | "update" | "edit" => Ok(Self::Modify),
            "delete" | "remove" => Ok(Self::Delete),
            "test" | "verify" => Ok(Self::Test),
            _ => Err(format!("Invalid checklist action: {}", s)),
        }
    }
}

fn lenient_action<'de, D: Deserializer<'de>>(d: D) -> Result<ChecklistAction, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    #[serde(default)]
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default, deserialize_with = "lenient_action")]
    pub action: ChecklistAction,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checklist {
    #[serde(default)]
    pub items: Vec<ChecklistItem>,
    #[serde(default = "default_test_strategy")]
    pub test_strategy: String,
}

fn default_test_strategy() -> String {
    "Run tests".to_string()
}

impl Checklist {
    /// Parse a model response: JSON first, markdown list fallback. Items are
    /// normalised (ids filled in, blank descriptions dropped).
    pub fn parse(text: &str) -> Checklist {
        let mut checklist = parse_json_response::<Checklist>(text)
            .filter(|c| !c.items.is_empty())
            .unwrap_or_else(|| Checklist::from_text(text));
        checklist.normalize();
        checklist
    }

    pub fn from_text(text: &str) -> Checklist {
        let mut items = Vec::new();
        let mut in_strategy = false;
        let mut strategy = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') {
                in_strategy = trimmed.to_ascii_lowercase().contains("test strategy");
                continue;
            }
            if in_strategy {
                if !trimmed.is_empty() {
                    strategy.push(trimmed.to_string());
                }
                continue;
            }
            if let Some(body) = list_item_body(trimmed) {
                items.push(item_from_line(body));
            }
        }
        Checklist {
            items,
            test_strategy: if strategy.is_empty() {
                default_test_strategy()
            } else {
                strategy.join("\n")
            },
        }
    }

    fn normalize(&mut self) {
        self.items.retain(|item| !item.description.trim().is_empty());
        let mut seen = HashSet::new();
        for (i, item) in self.items.iter_mut().enumerate() {
            if item.id.trim().is_empty() || !seen.insert(item.id.clone()) {
                item.id = format!("step-{}", i + 1);
                seen.insert(item.id.clone());
            }
            if item.file_path.as_deref().is_some_and(|p| p.trim().is_empty()) {
                item.file_path = None;
            }
        }
    }

    /// Items grouped into dependency waves. Every item appears exactly once;
    /// unknown dependencies are ignored and a dependency cycle is flushed as a
    /// final wave in checklist order.
    pub fn waves(&self) -> Vec<Vec<&ChecklistItem>> {
        let ids: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        let mut done: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&ChecklistItem> = self.items.iter().collect();
        let mut waves = Vec::new();

        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|item| {
                item.dependencies
                    .iter()
                    .filter(|d| ids.contains(d.as_str()) && d.as_str() != item.id)
                    .all(|d| done.contains(d.as_str()))
            });
            if ready.is_empty() {
                waves.push(blocked);
                break;
            }
            done.extend(ready.iter().map(|item| item.id.as_str()));
            waves.push(ready);
            pending = blocked;
        }
        waves
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::from("# Implementation Checklist\n\n");
        for (i, item) in self.items.iter().enumerate() {
            let checkbox = if item.completed { "[x]" } else { "[ ]" };
            let file = item
                .file_path
                .as_ref()
                .map(|f| format!(" (`{}`)", f))
                .unwrap_or_default();
            md.push_str(&format!(
                "{}. {} **{}**{}: {}\n",
                i + 1,
                checkbox,
                item.action.as_str().to_uppercase(),
                file,
                item.description
            ));
        }
        md.push_str(&format!("\n## Test Strategy\n{}\n", self.test_strategy));
        md
    }
}

fn list_item_body(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim());
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

/// `[ ] **MODIFY** (`src/x.py`): do the thing` and plainer variants.
fn item_from_line(body: &str) -> ChecklistItem {
    let mut rest = body
        .trim_start_matches("[ ]")
        .trim_start_matches("[x]")
        .trim();
    let mut action = None;
    if let Some(after) = rest.strip_prefix("**") {
        if let Some(end) = after.find("**") {
            action = after[..end].parse::<ChecklistAction>().ok();
            if action.is_some() {
                rest = after[end + 2..].trim();
            }
        }
    }
    let file_path = backticked_paths(rest).into_iter().next();
    let description = match rest.split_once("):") {
        Some((_, desc)) if rest.starts_with('(') => desc.trim(),
        _ => rest.trim_start_matches(':').trim(),
    };
    let action = action.unwrap_or(match &file_path {
        Some(_) => ChecklistAction::Modify,
        None => ChecklistAction::Test,
    });
    ChecklistItem {
        id: String::new(),
        description: description.to_string(),
        file_path,
        action,
        dependencies: Vec::new(),
        completed: false,
    }
}

// ── Summary ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub changes_made: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub risk_notes: Vec<String>,
}

impl RunSummary {
    /// Parse a model response. `files_changed` and `tests_passed` always come
    /// from what actually happened, never from the model.
    pub fn parse(text: &str, fallback_title: &str, files_changed: Vec<String>, tests_passed: bool) -> RunSummary {
        let mut summary = parse_json_response::<RunSummary>(text)
            .filter(|s| !s.title.trim().is_empty())
            .unwrap_or_else(|| RunSummary {
                title: fallback_title.to_string(),
                description: text.trim().to_string(),
                changes_made: Vec::new(),
                files_changed: Vec::new(),
                tests_passed,
                verification_steps: Vec::new(),
                risk_notes: Vec::new(),
            });
        summary.files_changed = files_changed;
        summary.tests_passed = tests_passed;
        summary
    }

    pub fn to_markdown(&self) -> String {
        let mut md = format!("# {}\n\n{}\n\n", self.title, self.description);
        md.push_str("## Changes Made\n");
        for change in &self.changes_made {
            md.push_str(&format!("- {}\n", change));
        }
        md.push_str("\n## Files Changed\n");
        for file in &self.files_changed {
            md.push_str(&format!("- `{}`\n", file));
        }
        md.push_str(&format!(
            "\n## Tests\n{}\n",
            if self.tests_passed {
                "✅ All tests passed"
            } else {
                "❌ Tests failed"
            }
        ));
        md.push_str("\n## Verification Steps\n");
        for (i, step) in self.verification_steps.iter().enumerate() {
            md.push_str(&format!("{}. {}\n", i + 1, step));
        }
        if !self.risk_notes.is_empty() {
            md.push_str("\n## Risk Notes\n");
            for note in &self.risk_notes {
                md.push_str(&format!("- ⚠️ {}\n", note));
            }
        }
        md
    }
}

// ── Text helpers ──────────────────────────────────────────────────────

fn first_heading(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# ").map(|h| h.trim().to_string()))
        .filter(|h| !h.is_empty())
}

fn one_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("Changes");
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

/// Backticked tokens that look like relative file paths.
fn backticked_paths(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for (i, part) in text.split('`').enumerate() {
        let candidate = part.trim();
        if i % 2 == 1
            && !candidate.is_empty()
            && !candidate.contains(char::is_whitespace)
            && candidate.contains('.')
            && !candidate.starts_with('/')
            && !paths.iter().any(|p| p == candidate)
        {
            paths.push(candidate.to_string());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parses_json_with_lenient_complexity() {
        let text = r#"Here you go: {"title": "Retry limit", "problem_statement": "p", "proposed_approach": "a",
            "affected_files": ["src/webhooks/processor.py"], "estimated_complexity": "Low", "risks": []}"#;
        let plan = Plan::parse(text, "Add retry limit");
        assert_eq!(plan.title, "Retry limit");
        assert_eq!(plan.estimated_complexity, Complexity::Low);
        assert_eq!(plan.affected_files, ["src/webhooks/processor.py"]);
    }

    #[test]
    fn test_plan_falls_back_to_prose() {
        let plan = Plan::parse(
            "# Webhook retries\nTouch `src/webhooks/processor.py` and `tests/test_processor.py`.",
            "Add retry limit to webhook processor",
        );
        assert_eq!(plan.title, "Webhook retries");
        assert_eq!(plan.problem_statement, "Add retry limit to webhook processor");
        assert_eq!(
            plan.affected_files,
            ["src/webhooks/processor.py", "tests/test_processor.py"]
        );
    }

    #[test]
    fn test_plan_markdown_layout() {
        let plan = Plan {
            title: "T".into(),
            problem_statement: "P".into(),
            proposed_approach: "A".into(),
            affected_files: vec!["a.py".into()],
            estimated_complexity: Complexity::High,
            risks: vec!["R".into()],
        };
        assert_eq!(
            plan.to_markdown(),
            "# T\n\n## Problem Statement\nP\n\n## Proposed Approach\nA\n\n## Affected Files\n- `a.py`\n\n## Estimated Complexity\nhigh\n\n## Risks\n- R\n"
        );
    }

    #[test]
    fn test_checklist_parse_normalizes_ids() {
        let text = r#"{"items": [
            {"description": "Add constant", "file_path": "a.py", "action": "modify"},
            {"id": "", "description": "  "},
            {"id": "t", "description": "Add test", "file_path": "", "action": "CREATE", "dependencies": ["step-1"]}
        ], "test_strategy": "pytest"}"#;
        let checklist = Checklist::parse(text);
        assert_eq!(checklist.items.len(), 2);
        assert_eq!(checklist.items[0].id, "step-1");
        assert_eq!(checklist.items[1].id, "t");
        assert_eq!(checklist.items[1].action, ChecklistAction::Create);
        assert_eq!(checklist.items[1].file_path, None);
    }

    #[test]
    fn test_checklist_markdown_fallback() {
        let text = "# Implementation Checklist\n\n\
                    1. [ ] **MODIFY** (`src/processor.py`): Add MAX_RETRIES\n\
                    2. [ ] **TEST**: Run the suite\n\
                    - Update `README.md` docs\n\n\
                    ## Test Strategy\nRun pytest\n";
        let checklist = Checklist::parse(text);
        assert_eq!(checklist.items.len(), 3);
        assert_eq!(checklist.items[0].action, ChecklistAction::Modify);
        assert_eq!(checklist.items[0].file_path.as_deref(), Some("src/processor.py"));
        assert_eq!(checklist.items[0].description, "Add MAX_RETRIES");
        assert_eq!(checklist.items[1].action, ChecklistAction::Test);
        assert_eq!(checklist.items[2].file_path.as_deref(), Some("README.md"));
        assert_eq!(checklist.test_strategy, "Run pytest");
    }

    #[test]
    fn test_checklist_without_items_is_empty() {
        assert!(Checklist::parse("I could not find anything to do.").items.is_empty());
    }

    #[test]
    fn test_waves_respect_dependencies_and_cycles() {
        let item = |id: &str, deps: &[&str]| ChecklistItem {
            id: id.into(),
            description: id.into(),
            file_path: None,
            action: ChecklistAction::Modify,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            completed: false,
        };
        let checklist = Checklist {
            items: vec![
                item("a", &[]),
                item("b", &["a"]),
                item("c", &["unknown"]),
                item("d", &["e"]),
                item("e", &["d"]),
            ],
            test_strategy: String::new(),
        };
        let ids: Vec<Vec<&str>> = checklist
            .waves()
            .iter()
            .map(|w| w.iter().map(|i| i.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "c"], vec!["b"], vec!["d", "e"]]);
    }

    #[test]
    fn test_checklist_markdown_layout() {
        let checklist = Checklist {
            items: vec![ChecklistItem {
                id: "1".into(),
                description: "Do it".into(),
                file_path: Some("a.py".into()),
                action: ChecklistAction::Create,
                dependencies: vec![],
                completed: true,
            }],
            test_strategy: "pytest".into(),
        };
        assert_eq!(
            checklist.to_markdown(),
            "# Implementation Checklist\n\n1. [x] **CREATE** (`a.py`): Do it\n\n## Test Strategy\npytest\n"
        );
    }

    #[test]
    fn test_summary_uses_actual_files_and_test_outcome() {
        let text = r#"{"title": "Add retry limit", "description": "d", "changes_made": ["c"],
            "files_changed": ["wrong.py"], "tests_passed": false, "verification_steps": ["run pytest"]}"#;
        let summary = RunSummary::parse(text, "fallback", vec!["src/processor.py".into()], true);
        assert_eq!(summary.files_changed, ["src/processor.py"]);
        assert!(summary.tests_passed);
        let md = summary.to_markdown();
        assert!(md.starts_with("# Add retry limit\n\nd\n\n## Changes Made\n- c\n"));
        assert!(md.contains("✅ All tests passed"));
        assert!(md.contains("1. run pytest"));
    }

    #[test]
    fn test_summary_prose_fallback() {
        let summary = RunSummary::parse("Changed things.", "Retry limit", vec![], true);
        assert_eq!(summary.title, "Retry limit");
        assert_eq!(summary.description, "Changed things.");
    }
}
