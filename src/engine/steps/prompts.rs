//! Prompt templates for the model-backed phases.

use crate::engine::documents::ChecklistItem;

pub const SYSTEM_PROMPT: &str = "You are DevFlow, a senior software engineer working inside an automated \
change pipeline. You read repository context, plan minimal focused changes, write \
production-quality code in the project's existing style, and keep tests passing. \
When asked for JSON, answer with a single JSON object and nothing else.";

pub fn plan_prompt(feature_request: &str, repo_context: &str) -> String {
    format!(
        r#"Analyze this feature request and write an implementation plan.

## Feature Request
{feature_request}

## Repository Context
{repo_context}

## Instructions
Produce a plan with a short title, a problem statement, the proposed approach,
the files that will be created or modified, an estimated complexity
(low, medium or high) and any risks.

Respond with a JSON object:
{{
  "title": "string",
  "problem_statement": "string",
  "proposed_approach": "string",
  "affected_files": ["string"],
  "estimated_complexity": "low|medium|high",
  "risks": ["string"]
}}"#
    )
}

pub fn checklist_prompt(plan_markdown: &str) -> String {
    format!(
        r#"Turn this plan into an ordered checklist of implementation steps.

## Plan
{plan_markdown}

## Instructions
Each item is one atomic action (create, modify, delete or test) on at most one
file, with a clear description. List prerequisites first and name them in
`dependencies` by id. Add a test strategy describing how to verify the change.

Respond with a JSON object:
{{
  "items": [
    {{
      "id": "short_id",
      "description": "what to do",
      "file_path": "path/to/file or null",
      "action": "create|modify|delete|test",
      "dependencies": ["ids of prerequisite items"]
    }}
  ],
  "test_strategy": "how to verify"
}}"#
    )
}

pub fn execute_prompt(
    item: &ChecklistItem,
    file_content: Option<&str>,
    repo_context: &str,
    allowed_programs: &[String],
) -> String {
    let item_json = serde_json::to_string_pretty(item).unwrap_or_else(|_| item.description.clone());
    let content = file_content.unwrap_or("(new file)");
    let programs = allowed_programs.join(", ");
    format!(
        r#"Carry out this checklist item by producing the complete new file content.

## Checklist Item
{item_json}

## Current File Content
{content}

## Repository Context
{repo_context}

## Instructions
Make the smallest change that completes the item and follows the existing
style. Return the COMPLETE file content, not a fragment. Set "delete" to true
to remove the file instead. Optionally list commands to run in the sandbox
(allowed programs: {programs}).

Respond with a JSON object:
{{
  "file_path": "path/to/file",
  "new_content": "complete file content",
  "delete": false,
  "explanation": "what changed",
  "commands": [{{"program": "pytest", "args": ["-q"]}}]
}}"#
    )
}

pub fn repair_prompt(plan_markdown: &str, diff: &str, defects: &str, repo_context: &str) -> String {
    format!(
        r#"The current change failed validation. Fix it.

## Plan
{plan_markdown}

## Current Diff
```diff
{diff}
```

## Validation Failures
{defects}

## Relevant Code
{repo_context}

## Instructions
Find the root cause of each failure and return corrected COMPLETE contents for
every file that must change. Use "delete": true to remove a file.

Respond with a JSON object:
{{
  "changes": [
    {{"file_path": "path/to/file", "new_content": "complete file content", "delete": false}}
  ],
  "explanation": "what was fixed and why"
}}"#
    )
}

pub fn summary_prompt(feature_request: &str, changes: &str, test_results: &str) -> String {
    format!(
        r#"Write a pull-request summary for these changes.

## Feature Request
{feature_request}

## Changes Made
{changes}

## Test Results
{test_results}

## Instructions
Give a concise PR title, an overall description, the specific changes, how a
reviewer can verify them, and anything reviewers should watch out for.

Respond with a JSON object:
{{
  "title": "PR title",
  "description": "overall description",
  "changes_made": ["change"],
  "verification_steps": ["step"],
  "risk_notes": ["note"]
}}"#
    )
}
