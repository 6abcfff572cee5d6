//! Markdown plan parser.
//!
//! Parses a PM assistant's markdown reply into structured goals and tasks.
//! The grammar is deliberately tolerant: a plan is detected by a
//! `Plan`/`Goals`/`Tasks` heading, entries are list items, and malformed
//! lines are skipped rather than failing the parse. A detected plan with
//! no entries yields `has_plan = true` with empty lists so the cascade can
//! distinguish "no plan" from "plan we could not extract from".

use serde::{Deserialize, Serialize};

/// Parse result for a PM markdown reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPlan {
    pub has_plan: bool,
    pub goals: Vec<PlanGoal>,
    pub tasks: Vec<PlanTask>,
}

/// One goal entry extracted from a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGoal {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    /// Nested bullets under the goal entry. Stored on the goal description
    /// by the cascade; never materialized as tasks directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_tasks: Vec<String>,
}

/// One task entry extracted from a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTask {
    pub text: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Goals,
    Tasks,
}

/// Parse a markdown plan. Pure; never fails.
pub fn parse_plan(markdown: &str) -> ParsedPlan {
    let mut parsed = ParsedPlan::default();
    let mut section = Section::None;

    for raw_line in markdown.lines() {
        let line = raw_line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if let Some(heading) = heading_text(line) {
            let lower = heading.to_lowercase();
            if lower.contains("goal") {
                section = Section::Goals;
                parsed.has_plan = true;
            } else if lower.contains("task") {
                section = Section::Tasks;
                parsed.has_plan = true;
            } else if lower.contains("plan") {
                section = Section::None;
                parsed.has_plan = true;
            } else {
                section = Section::None;
            }
            continue;
        }

        let indent = line.len() - line.trim_start().len();
        let Some(item) = list_item_text(line.trim_start()) else {
            continue;
        };

        match section {
            Section::Goals => {
                if indent == 0 {
                    if let Some(goal) = parse_goal_entry(item) {
                        parsed.goals.push(goal);
                    }
                } else if let Some(goal) = parsed.goals.last_mut() {
                    goal.suggested_tasks.push(item.to_owned());
                }
            }
            Section::Tasks => {
                if indent == 0 {
                    if let Some(task) = parse_task_entry(item) {
                        parsed.tasks.push(task);
                    }
                }
            }
            Section::None => {}
        }
    }

    parsed
}

/// Text of a heading line: ATX headings (`## Goals`) and bold-only lines
/// (`**Goals:**`).
fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('#') {
        let rest = rest.trim_start_matches('#').trim();
        return Some(rest);
    }
    if let Some(inner) = trimmed
        .strip_prefix("**")
        .and_then(|r| r.strip_suffix("**"))
    {
        return Some(inner.trim_end_matches(':'));
    }
    None
}

/// Content of a list item: `- x`, `* x`, or `3. x`.
fn list_item_text(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim());
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return Some(rest.trim());
        }
    }
    None
}

fn parse_goal_entry(item: &str) -> Option<PlanGoal> {
    let mut text = item.to_owned();
    let phase = extract_parenthesized(&mut text, "phase").and_then(|v| v.trim().parse().ok());
    let priority = extract_bracketed(&mut text, "priority");

    let text = text.replace("**", "");
    let (title, description) = split_title(&text);
    if title.is_empty() {
        return None;
    }

    Some(PlanGoal {
        title,
        description,
        priority,
        phase,
        suggested_tasks: Vec::new(),
    })
}

fn parse_task_entry(item: &str) -> Option<PlanTask> {
    let mut text = item.to_owned();

    // Leading `[agent]` assignment.
    let mut agent = None;
    if text.starts_with('[') {
        if let Some(end) = text.find(']') {
            let inner = text[1..end].trim();
            // Skip checkbox markers like `[ ]` / `[x]`.
            if !inner.is_empty() && inner != "x" && inner != "X" {
                agent = Some(inner.to_owned());
            }
            text = text[end + 1..].trim_start().to_owned();
        }
    }

    let time = extract_parenthesized(&mut text, "est")
        .or_else(|| extract_parenthesized(&mut text, "time"))
        .map(|v| v.trim().to_owned());

    let text = text.replace("**", "");
    let (task_text, description) = split_title(&text);
    if task_text.is_empty() {
        return None;
    }

    Some(PlanTask {
        text: task_text,
        description,
        agent,
        time,
    })
}

/// Case-insensitive (ASCII) prefix test, safe on any char boundary.
fn starts_with_ci(s: &str, prefix: &str) -> bool {
    let mut chars = s.chars();
    prefix
        .chars()
        .all(|p| matches!(chars.next(), Some(c) if c.eq_ignore_ascii_case(&p)))
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| starts_with_ci(&haystack[i..], needle))
}

/// Remove `(key: value)` or `(key value)` from the text and return the value.
fn extract_parenthesized(text: &mut String, key: &str) -> Option<String> {
    let open = find_ci(text, &format!("({key}"))?;
    let close = text[open..].find(')')? + open;
    let inner = &text[open + 1 + key.len()..close];
    let value = inner.trim_start_matches(':').trim().to_owned();
    text.replace_range(open..=close, "");
    *text = text.trim().to_owned();
    Some(value)
}

/// Remove `[key: value]` from the text and return the value.
fn extract_bracketed(text: &mut String, key: &str) -> Option<String> {
    let open = find_ci(text, &format!("[{key}"))?;
    let close = text[open..].find(']')? + open;
    let inner = &text[open + 1 + key.len()..close];
    let value = inner.trim_start_matches(':').trim().to_owned();
    text.replace_range(open..=close, "");
    *text = text.trim().to_owned();
    if value.is_empty() { None } else { Some(value) }
}

/// Split an entry into title and description on the first separator:
/// an em/en dash, ` - `, or `: `.
fn split_title(text: &str) -> (String, String) {
    for sep in [" \u{2014} ", " \u{2013} ", " - ", ": "] {
        if let Some((title, desc)) = text.split_once(sep) {
            return (title.trim().to_owned(), desc.trim().to_owned());
        }
    }
    (text.trim().to_owned(), String::new())
}
