use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;

use super::{CheckResult, Defect, NextAction, PipelineState, StepContext, StepOutcome, ValidationReport};
use crate::engine::models::{ArtifactUpdate, EventKind, Phase};
use crate::errors::{StepError, ToolError};
use crate::tools::process::ProcessOutput;
use crate::tools::repo_map::{RepoMapOutput, RepoQuery};
use crate::tools::sandbox::ExecRequest;
use crate::tools::{ToolCall, ToolOutput, excerpt};

const DEFECT_OUTPUT_BYTES: usize = 4096;
const RELATED_FILES: usize = 5;
const MAX_SYMBOLS: usize = 8;

// Names a failing check complains about, e.g. `NameError: name 'foo' is not defined`.
static SYMBOL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"name '(\w+)' is not defined",
        r"cannot import name '(\w+)'",
        r"has no attribute '(\w+)'",
        r"\b(\w+)\(\) (?:missing|takes|got an unexpected)",
        r"undefined name '(\w+)'",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub(super) async fn run(ctx: &StepContext, state: &mut PipelineState) -> Result<StepOutcome, StepError> {
    let mut defects = Vec::new();
    let mut checks = Vec::new();

    if state.diff.trim().is_empty() {
        defects.push(Defect {
            check: "diff".to_string(),
            command: "git diff".to_string(),
            exit_code: None,
            output: "execution produced no changes".to_string(),
            related_files: Vec::new(),
        });
    }

    for spec in &ctx.config.validation.checks {
        ctx.ensure_active()?;
        let request = ExecRequest::new(&spec.program, &spec.args);

        let first = run_check(ctx, &request).await?;
        let (output, flaky) = if first.success {
            (first, false)
        } else {
            ctx.events
                .for_phase(Phase::Validate)
                .emit(
                    EventKind::Retry,
                    json!({
                        "check": spec.name,
                        "exit_code": first.exit_code,
                        "reason": "re-running failed check once",
                    }),
                )
                .await;
            let second = run_check(ctx, &request).await?;
            let flaky = second.success;
            (second, flaky)
        };

        if flaky {
            tracing::warn!(run_id = %ctx.run.id, check = %spec.name, "check passed only on re-run");
        }
        checks.push(CheckResult {
            name: spec.name.clone(),
            passed: output.success,
            flaky,
            exit_code: output.exit_code,
        });

        if !output.success {
            let text = excerpt(&output, DEFECT_OUTPUT_BYTES);
            let related_files = related_files(ctx, &text).await?;
            defects.push(Defect {
                check: spec.name.clone(),
                command: request.display(),
                exit_code: output.exit_code,
                output: text,
                related_files,
            });
        }
    }

    state.budget.record_attempt();
    let passed = defects.is_empty();
    state.validation = Some(ValidationReport { passed, checks });
    tracing::info!(
        run_id = %ctx.run.id,
        passed,
        attempt = state.budget.validation_attempts,
        max_attempts = state.budget.max_attempts,
        defects = defects.len(),
        "validation finished"
    );

    let next = if passed {
        NextAction::Advance
    } else if state.budget.can_repair() {
        NextAction::Repair { defects }
    } else {
        NextAction::Fail {
            reason: "validation budget exhausted".to_string(),
        }
    };
    Ok(StepOutcome {
        artifacts: ArtifactUpdate::default(),
        next,
    })
}

async fn run_check(ctx: &StepContext, request: &ExecRequest) -> Result<ProcessOutput, StepError> {
    match ctx
        .tools
        .call_with_retry(Phase::Validate, ToolCall::Sandbox(request.clone()))
        .await?
    {
        ToolOutput::Sandbox(output) => Ok(output),
        other => Err(StepError::Internal(anyhow::anyhow!(
            "unexpected sandbox output: {:?}",
            other
        ))),
    }
}

/// Files defining the symbols named in the failure, then files whose
/// content best matches it.
async fn related_files(ctx: &StepContext, output: &str) -> Result<Vec<String>, StepError> {
    let mut candidates = defining_files(ctx, &failure_symbols(output)).await?;
    let excerpts = ctx.memory.retrieve(output, ctx.memory.default_k()).await?;
    candidates.extend(excerpts.into_iter().map(|excerpt| excerpt.path));

    let mut files: Vec<String> = Vec::new();
    for path in candidates {
        if !files.contains(&path) {
            files.push(path);
        }
        if files.len() == RELATED_FILES {
            break;
        }
    }
    Ok(files)
}

/// Symbols referenced by error messages in `output`, first occurrence first.
fn failure_symbols(output: &str) -> Vec<String> {
    let mut symbols: Vec<String> = Vec::new();
    for line in output.lines() {
        for pattern in SYMBOL_PATTERNS.iter() {
            for captures in pattern.captures_iter(line) {
                let Some(symbol) = captures.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                if !symbols.iter().any(|s| s == symbol) {
                    symbols.push(symbol.to_string());
                }
            }
        }
        if symbols.len() >= MAX_SYMBOLS {
            symbols.truncate(MAX_SYMBOLS);
            break;
        }
    }
    symbols
}

/// Line pattern matching a Python definition or module-level assignment of
/// any of `symbols`.
fn definition_pattern(symbols: &[String]) -> String {
    let names = symbols.iter().map(|s| regex::escape(s)).collect::<Vec<_>>().join("|");
    format!(r"^\s*(?:(?:async\s+)?def|class)\s+(?:{names})\b|^(?:{names})\s*[:=]")
}

async fn defining_files(ctx: &StepContext, symbols: &[String]) -> Result<Vec<String>, StepError> {
    if symbols.is_empty() {
        return Ok(Vec::new());
    }
    let call = ToolCall::RepoMap(RepoQuery::Search {
        pattern: definition_pattern(symbols),
        max_matches: RELATED_FILES * 4,
    });
    match ctx.tools.call(Phase::Validate, call).await {
        Ok(ToolOutput::RepoMap(RepoMapOutput::Matches { matches })) => {
            Ok(matches.into_iter().map(|m| m.path).collect())
        }
        Ok(_) => Ok(Vec::new()),
        Err(e @ ToolError::Cancelled { .. }) => Err(e.into()),
        // Best effort: retrieval still supplies candidates.
        Err(e) => {
            tracing::debug!(run_id = %ctx.run.id, error = %e, "symbol search failed");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_symbols_from_python_errors() {
        let output = "\
E   NameError: name 'compute_total' is not defined
E   ImportError: cannot import name 'RetryPolicy' from 'app.retry'
E   AttributeError: 'Client' object has no attribute 'send_batch'
E   TypeError: parse() missing 1 required positional argument: 'raw'
E   NameError: name 'compute_total' is not defined";
        assert_eq!(
            failure_symbols(output),
            vec!["compute_total", "RetryPolicy", "send_batch", "parse"]
        );
        assert!(failure_symbols("1 failed, 3 passed").is_empty());
    }

    #[test]
    fn test_definition_pattern_matches_definitions_only() {
        let pattern = Regex::new(&definition_pattern(&["RetryPolicy".into(), "parse".into()])).unwrap();
        assert!(pattern.is_match("class RetryPolicy:"));
        assert!(pattern.is_match("    async def parse(self, raw):"));
        assert!(pattern.is_match("parse = make_parser()"));
        assert!(!pattern.is_match("    return parse(raw)"));
        assert!(!pattern.is_match("def parse_all():"));
    }
}
