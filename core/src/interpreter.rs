//! Scans assistant text for a small set of tool-invocation expressions,
//! applies their side effects to the todo store, and rewrites the text into
//! human-readable acknowledgements.
//!
//! Matching is textual. Named expressions are recognized with a small
//! regular-pattern set; after every rewrite the scan restarts from the
//! beginning of the modified text so overlapping rewrites compose. The
//! `<TODO_SEPARATOR>` block is parsed with explicit string scanning because
//! embedded quotes and newlines defeat pattern matching.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::todo::TodoStatus;
use crate::todo::TodoStore;
use crate::todo::render_list;

pub const TODO_SEPARATOR: &str = "<TODO_SEPARATOR>";

/// Execution-control expressions surfaced to the coordinator. The
/// interpreter itself never executes anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    ExecuteNext,
    ExecuteAll,
    ExecuteTodo(u64),
    ApprovalRequested(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretOutcome {
    /// The assistant text with every recognized expression rewritten.
    pub text: String,
    /// Control requests in the order they appeared.
    pub controls: Vec<ControlRequest>,
    /// Whether any todo mutation happened.
    pub mutated: bool,
}

// Both quoting styles are accepted; a double-quoted argument may contain
// single quotes and vice versa.
const QUOTED: &str = r#"(?:"([^"]*)"|'([^']*)')"#;

/// The pattern set is fixed at compile time; a failure to compile one is a
/// programming error.
fn compiled(pattern: &str) -> Regex {
    #[allow(clippy::unwrap_used)]
    let regex = Regex::new(pattern).unwrap();
    regex
}

static ADD_TODO: LazyLock<Regex> =
    LazyLock::new(|| compiled(&format!(r"add_todo\(\s*{QUOTED}\s*,\s*{QUOTED}\s*\)")));
static LIST_TODOS: LazyLock<Regex> = LazyLock::new(|| compiled(r"list_todos\(\s*\)"));
static MARK_COMPLETE: LazyLock<Regex> = LazyLock::new(|| compiled(r"mark_complete\(\s*(\d+)\s*\)"));
static DELETE_TODO: LazyLock<Regex> = LazyLock::new(|| compiled(r"delete_todo\(\s*(\d+)\s*\)"));
static EXECUTE_NEXT: LazyLock<Regex> = LazyLock::new(|| compiled(r"execute_next\(\s*\)"));
static EXECUTE_ALL: LazyLock<Regex> = LazyLock::new(|| compiled(r"execute_all\(\s*\)"));
static EXECUTE_TODO: LazyLock<Regex> = LazyLock::new(|| compiled(r"execute_todo\(\s*(\d+)\s*\)"));
static REQUEST_APPROVAL: LazyLock<Regex> =
    LazyLock::new(|| compiled(&format!(r"request_user_approval\(\s*{QUOTED}\s*\)")));

// Acknowledgements can themselves contain recognizable text when a title
// embeds an expression in the other quoting style; the cap bounds the
// rescan loop regardless.
const MAX_REWRITES: usize = 256;

pub fn interpret(text: &str, todos: &mut TodoStore) -> InterpretOutcome {
    let mut out = text.to_string();
    let mut controls = Vec::new();
    let mut mutated = false;

    for _ in 0..MAX_REWRITES {
        if !rewrite_once(&mut out, todos, &mut controls, &mut mutated) {
            break;
        }
    }

    InterpretOutcome {
        text: out,
        controls,
        mutated,
    }
}

/// Apply the first recognizable expression, in the documented order.
/// Returns false at fixpoint.
fn rewrite_once(
    text: &mut String,
    todos: &mut TodoStore,
    controls: &mut Vec<ControlRequest>,
    mutated: &mut bool,
) -> bool {
    if let Some(captures) = ADD_TODO.captures(text) {
        let all = range_of(&captures);
        let title = quoted_arg(&captures, 1);
        let description = quoted_arg(&captures, 3);
        let replacement = match todos.add(&title, &description) {
            Ok(_) => {
                *mutated = true;
                format!("**Added:** {}", title.trim())
            }
            Err(e) => format!("**Todo rejected:** {e}"),
        };
        text.replace_range(all, &replacement);
        return true;
    }

    if let Some(block) = find_separator_block(text) {
        let replacement = match block.title {
            Some(title) => match todos.add(&title, block.description.as_deref().unwrap_or("")) {
                Ok(_) => {
                    *mutated = true;
                    format!("**Added:** {}", title.trim())
                }
                Err(e) => format!("**Todo rejected:** {e}"),
            },
            None => "**Todo block ignored:** missing Title field".to_string(),
        };
        text.replace_range(block.span, &replacement);
        return true;
    }

    if let Some(found) = LIST_TODOS.find(text) {
        let range = found.range();
        let rendered = render_list(&todos.list(true));
        text.replace_range(range, rendered.trim_end());
        return true;
    }

    if let Some(captures) = MARK_COMPLETE.captures(text) {
        let all = range_of(&captures);
        let id = numeric_arg(&captures);
        let replacement = match todos.get(id) {
            Some(item) if todos.set_status(id, TodoStatus::Completed) => {
                *mutated = true;
                format!("**Completed:** #{id} {}", item.title)
            }
            _ => format!("**Todo #{id} not found**"),
        };
        text.replace_range(all, &replacement);
        return true;
    }

    if let Some(captures) = DELETE_TODO.captures(text) {
        let all = range_of(&captures);
        let id = numeric_arg(&captures);
        let replacement = match todos.get(id) {
            Some(item) if todos.delete(id) => {
                *mutated = true;
                format!("**Deleted:** #{id} {}", item.title)
            }
            _ => format!("**Todo #{id} not found**"),
        };
        text.replace_range(all, &replacement);
        return true;
    }

    if let Some(found) = EXECUTE_NEXT.find(text) {
        let range = found.range();
        controls.push(ControlRequest::ExecuteNext);
        text.replace_range(range, "**Executing next pending todo…**");
        return true;
    }

    if let Some(found) = EXECUTE_ALL.find(text) {
        let range = found.range();
        controls.push(ControlRequest::ExecuteAll);
        text.replace_range(range, "**Executing all pending todos…**");
        return true;
    }

    if let Some(captures) = EXECUTE_TODO.captures(text) {
        let all = range_of(&captures);
        let id = numeric_arg(&captures);
        controls.push(ControlRequest::ExecuteTodo(id));
        text.replace_range(all, &format!("**Executing todo #{id}…**"));
        return true;
    }

    if let Some(captures) = REQUEST_APPROVAL.captures(text) {
        let all = range_of(&captures);
        let reason = quoted_arg(&captures, 1);
        controls.push(ControlRequest::ApprovalRequested(reason.clone()));
        text.replace_range(all, &format!("**Approval requested:** {reason}"));
        return true;
    }

    false
}

fn range_of(captures: &regex_lite::Captures<'_>) -> std::ops::Range<usize> {
    // Group 0 always exists on a successful match.
    #[allow(clippy::unwrap_used)]
    let whole = captures.get(0).unwrap();
    whole.range()
}

/// First non-empty alternative of a quoted argument starting at capture
/// group `base` (double-quoted) with `base + 1` as the single-quoted twin.
fn quoted_arg(captures: &regex_lite::Captures<'_>, base: usize) -> String {
    captures
        .get(base)
        .or_else(|| captures.get(base + 1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn numeric_arg(captures: &regex_lite::Captures<'_>) -> u64 {
    captures
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or_default()
}

struct SeparatorBlock {
    span: std::ops::Range<usize>,
    title: Option<String>,
    description: Option<String>,
}

/// Locate the first `<TODO_SEPARATOR>` … `<TODO_SEPARATOR>` block and pull
/// the `Title:` and `Description:` fields out with plain string scanning.
/// The description runs from its label to the end of the block, so it may
/// contain quotes and newlines.
fn find_separator_block(text: &str) -> Option<SeparatorBlock> {
    let open = text.find(TODO_SEPARATOR)?;
    let inner_start = open + TODO_SEPARATOR.len();
    let close_rel = text[inner_start..].find(TODO_SEPARATOR)?;
    let inner = &text[inner_start..inner_start + close_rel];
    let span = open..inner_start + close_rel + TODO_SEPARATOR.len();

    let mut title = None;
    let mut description = None;
    for (offset, line) in inner.lines().map(|l| (line_offset(inner, l), l)) {
        let trimmed = line.trim_start();
        if title.is_none() && let Some(rest) = trimmed.strip_prefix("Title:") {
            title = Some(rest.trim().to_string());
        } else if description.is_none() && let Some(rest) = trimmed.strip_prefix("Description:") {
            // Everything after the label through the end of the block.
            let label_end = offset + (line.len() - rest.len());
            description = Some(inner[label_end..].trim().to_string());
            break;
        }
    }

    Some(SeparatorBlock {
        span,
        title,
        description,
    })
}

fn line_offset(haystack: &str, line: &str) -> usize {
    // `lines()` yields subslices of `haystack`, so pointer arithmetic gives
    // the byte offset of each line.
    line.as_ptr() as usize - haystack.as_ptr() as usize
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_todo_inserts_and_rewrites() {
        let mut todos = TodoStore::new();
        let outcome = interpret(r#"I queued it: add_todo("Write docs", "API section")"#, &mut todos);
        assert_eq!(outcome.text, "I queued it: **Added:** Write docs");
        assert!(outcome.mutated);
        let item = todos.get(1).unwrap();
        assert_eq!(item.title, "Write docs");
        assert_eq!(item.description, "API section");
    }

    #[test]
    fn single_quoted_arguments_are_accepted() {
        let mut todos = TodoStore::new();
        let outcome = interpret("add_todo('Fix \"bug\"', 'in parser')", &mut todos);
        assert_eq!(outcome.text, "**Added:** Fix \"bug\"");
        assert_eq!(todos.get(1).unwrap().title, "Fix \"bug\"");
    }

    #[test]
    fn composition_processes_left_to_right() {
        let mut todos = TodoStore::new();
        let outcome = interpret(
            r#"add_todo("A","x") add_todo("B","y") list_todos()"#,
            &mut todos,
        );
        assert_eq!(todos.get(1).unwrap().title, "A");
        assert_eq!(todos.get(2).unwrap().title, "B");
        assert!(outcome.text.contains("**Added:** A"));
        assert!(outcome.text.contains("**Added:** B"));
        let list_pos = outcome.text.find("Todos:").unwrap();
        let a_pos = outcome.text[list_pos..].find("#1 A").unwrap();
        let b_pos = outcome.text[list_pos..].find("#2 B").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn separator_block_tolerates_quotes_and_newlines() {
        let mut todos = TodoStore::new();
        let text = "Plan:\n<TODO_SEPARATOR>\nTitle: Ship \"v2\"\nDescription: Steps:\n1. tag\n2. push\n<TODO_SEPARATOR>\ndone";
        let outcome = interpret(text, &mut todos);
        assert_eq!(outcome.text, "Plan:\n**Added:** Ship \"v2\"\ndone");
        let item = todos.get(1).unwrap();
        assert_eq!(item.title, "Ship \"v2\"");
        assert_eq!(item.description, "Steps:\n1. tag\n2. push");
    }

    #[test]
    fn separator_block_without_title_is_consumed_not_looped() {
        let mut todos = TodoStore::new();
        let outcome = interpret("<TODO_SEPARATOR>\nnothing here\n<TODO_SEPARATOR>", &mut todos);
        assert!(outcome.text.contains("missing Title"));
        assert!(todos.is_empty());
    }

    #[test]
    fn mark_complete_reports_success_and_not_found() {
        let mut todos = TodoStore::new();
        todos.add("task", "").unwrap();
        let outcome = interpret("mark_complete(1) mark_complete(9)", &mut todos);
        assert!(outcome.text.contains("**Completed:** #1 task"));
        assert!(outcome.text.contains("**Todo #9 not found**"));
        assert_eq!(todos.get(1).unwrap().status, TodoStatus::Completed);
    }

    #[test]
    fn delete_todo_removes_the_item() {
        let mut todos = TodoStore::new();
        todos.add("gone", "").unwrap();
        let outcome = interpret("delete_todo(1)", &mut todos);
        assert!(outcome.text.contains("**Deleted:** #1 gone"));
        assert!(todos.get(1).is_none());
    }

    #[test]
    fn execution_forms_become_control_requests() {
        let mut todos = TodoStore::new();
        let outcome = interpret(
            "execute_next() then execute_all() then execute_todo(3)",
            &mut todos,
        );
        assert_eq!(
            outcome.controls,
            vec![
                ControlRequest::ExecuteNext,
                ControlRequest::ExecuteAll,
                ControlRequest::ExecuteTodo(3),
            ]
        );
        assert!(outcome.text.contains("**Executing next pending todo…**"));
    }

    #[test]
    fn request_user_approval_surfaces_the_reason() {
        let mut todos = TodoStore::new();
        let outcome = interpret(
            r#"request_user_approval("deleting prod data")"#,
            &mut todos,
        );
        assert_eq!(
            outcome.controls,
            vec![ControlRequest::ApprovalRequested(
                "deleting prod data".to_string()
            )]
        );
        assert_eq!(outcome.text, "**Approval requested:** deleting prod data");
    }

    #[test]
    fn text_without_expressions_is_untouched() {
        let mut todos = TodoStore::new();
        let text = "Just prose, mentioning add_todo in passing without a call.";
        let outcome = interpret(text, &mut todos);
        assert_eq!(outcome.text, text);
        assert!(outcome.controls.is_empty());
        assert!(!outcome.mutated);
    }

    #[test]
    fn empty_title_from_model_is_rejected_not_inserted() {
        let mut todos = TodoStore::new();
        let outcome = interpret(r#"add_todo("", "desc")"#, &mut todos);
        assert!(outcome.text.contains("**Todo rejected:**"));
        assert!(todos.is_empty());
    }
}
