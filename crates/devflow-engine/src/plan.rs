//! Phase plans and phase-level semantics per workflow kind.

use devflow_llm::Message;
use devflow_types::{PhaseName, Workflow, WorkflowKind};

/// The ordered phase plan for a workflow kind.
#[must_use]
pub fn phases_for(kind: WorkflowKind) -> &'static [PhaseName] {
    use PhaseName::*;
    match kind {
        WorkflowKind::Standard => &[Plan, Build, Test, Review],
        WorkflowKind::Tdd => &[
            Plan,
            GenerateTests,
            VerifyRed,
            Build,
            VerifyGreen,
            Refactor,
            Review,
        ],
        WorkflowKind::PlanOnly => &[Plan],
        WorkflowKind::TestOnly => &[Test],
        WorkflowKind::ReviewOnly => &[Review],
    }
}

/// Optional phases are skipped (not failed) when their retries run out.
#[must_use]
pub fn is_optional(phase: PhaseName) -> bool {
    matches!(phase, PhaseName::Refactor)
}

/// Per-phase instructions sent as the system message.
fn instructions(phase: PhaseName) -> &'static str {
    match phase {
        PhaseName::Plan => {
            "You are a senior engineer. Produce a concrete implementation plan \
             for the task: the files to touch, the order of changes, and the risks."
        }
        PhaseName::Build => {
            "Implement the task following the agreed plan. Output the code changes."
        }
        PhaseName::Test => "Write and run the tests for the change. Report the results.",
        PhaseName::Review => {
            "Review the change for correctness, style, and missed edge cases. \
             Be specific about anything that must change."
        }
        PhaseName::Deploy => "Prepare the change for deployment and report the steps taken.",
        PhaseName::GenerateTests => {
            "Write failing tests that capture the requested behavior before any \
             implementation exists."
        }
        PhaseName::VerifyRed => {
            "Run the generated tests against the unmodified code. Report the number \
             of failing tests as the final line of your answer, as a bare integer."
        }
        PhaseName::VerifyGreen => {
            "Run the full test suite against the implementation. Report the number \
             of failing tests as the final line of your answer, as a bare integer."
        }
        PhaseName::Refactor => {
            "Refactor the implementation for clarity without changing behavior. \
             All tests must still pass."
        }
    }
}

/// Build the message sequence for a phase from the task description and the
/// phases completed so far.
#[must_use]
pub fn build_messages(phase: PhaseName, workflow: &Workflow, completed: &[PhaseName]) -> Vec<Message> {
    let mut user = format!("Task: {}", workflow.task);
    if let Some(issue_ref) = &workflow.issue_ref {
        user.push_str(&format!("\nIssue: {issue_ref}"));
    }
    if !completed.is_empty() {
        let done: Vec<&str> = completed.iter().map(|p| p.as_str()).collect();
        user.push_str(&format!("\nCompleted phases so far: {}", done.join(", ")));
    }
    vec![Message::system(instructions(phase)), Message::user(user)]
}

/// TDD verify semantics.
///
/// Both verify phases expect the final whitespace-separated token of the
/// response to be the failing-test count. `verify_red` demands failures (the
/// fresh tests must not pass against unmodified code); `verify_green`
/// demands zero. Anything unparsable is a permanent phase failure.
pub fn evaluate_verify(phase: PhaseName, response_text: &str) -> Result<(), String> {
    let count = match parse_failing_count(response_text) {
        Some(count) => count,
        None => {
            if matches!(phase, PhaseName::VerifyRed | PhaseName::VerifyGreen) {
                return Err(format!(
                    "{phase}: response did not end with a failing-test count"
                ));
            }
            return Ok(());
        }
    };
    match phase {
        PhaseName::VerifyRed if count == 0 => {
            Err("tests unexpectedly passed in red phase".to_string())
        }
        PhaseName::VerifyGreen if count != 0 => {
            Err(format!("tests failed in green phase: {count} failing"))
        }
        _ => Ok(()),
    }
}

fn parse_failing_count(text: &str) -> Option<u64> {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())?
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}
