//! Task document handling and iteration prompt composition.

use std::sync::OnceLock;

use regex::Regex;

/// Written to `task.md` when a loop starts without task content
pub const TASK_TEMPLATE: &str = "# Task

Describe the goal here.

## Checklist

- [ ] First step

## Notes

";

/// Prepended every `reflect_every` iterations
pub const REFLECTION_PROMPT: &str = "## Reflection

Before continuing, review your progress so far. Re-read the task file, check which \
checklist items are really done, update the checklist and notes to match reality, \
and adjust the plan if the current approach is not working. Then continue with the \
next unchecked item.";

/// Progress counts for markdown checklist items (`- [ ]`, `- [x]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checklist {
    pub done: usize,
    pub open: usize,
}

impl Checklist {
    pub fn parse(task: &str) -> Self {
        static ITEM: OnceLock<Regex> = OnceLock::new();
        let item = ITEM.get_or_init(|| {
            Regex::new(r"(?m)^\s*[-*+]\s+\[([ xX])\]").expect("checklist regex is valid")
        });

        let mut checklist = Checklist::default();
        for caps in item.captures_iter(task) {
            if &caps[1] == " " {
                checklist.open += 1;
            } else {
                checklist.done += 1;
            }
        }
        checklist
    }

    /// At least one item exists and none is open
    pub fn is_complete(&self) -> bool {
        self.open == 0 && self.done > 0
    }
}

/// Inputs to one iteration's prompt
#[derive(Debug, Clone)]
pub struct PromptParts<'a> {
    pub iteration: u32,
    pub max_iterations: Option<u32>,
    pub task_path: &'a str,
    pub task: &'a str,
    pub completion_promise: &'a str,
    pub reflect: bool,
    pub follow_ups: Option<&'a str>,
}

/// Whether iteration `iteration` (1-indexed) carries the reflection block
pub fn reflection_due(iteration: u32, reflect_every: u32) -> bool {
    reflect_every > 0 && iteration % reflect_every == 0
}

/// Build the full prompt sent to the agent for one iteration
pub fn compose_prompt(parts: &PromptParts<'_>) -> String {
    let mut prompt = String::new();

    if parts.reflect {
        prompt.push_str(REFLECTION_PROMPT);
        prompt.push_str("\n\n");
    }

    match parts.max_iterations {
        Some(max) => prompt.push_str(&format!(
            "Iteration {} of {}. ",
            parts.iteration, max
        )),
        None => prompt.push_str(&format!("Iteration {}. ", parts.iteration)),
    }
    prompt.push_str(&format!(
        "You start with no memory of earlier iterations. The task file at {} is your \
working memory: read it, work on the next open item, and record progress there \
before you finish.\n\n",
        parts.task_path
    ));

    prompt.push_str(parts.task.trim_end());
    prompt.push_str("\n\n");

    if let Some(follow_ups) = parts.follow_ups {
        prompt.push_str("## Operator follow-up\n\n");
        prompt.push_str(follow_ups.trim_end());
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "When the whole task is finished, reply with <promise>{}</promise>.",
        parts.completion_promise
    ));
    prompt
}

/// Matches `<promise>TEXT</promise>` for the configured promise
pub fn promise_regex(completion_promise: &str) -> Regex {
    Regex::new(&format!(
        r"<promise>\s*{}\s*</promise>",
        regex::escape(completion_promise)
    ))
    .expect("escaped promise regex is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(task: &'a str) -> PromptParts<'a> {
        PromptParts {
            iteration: 2,
            max_iterations: Some(5),
            task_path: ".agent-loop/demo/task.md",
            task,
            completion_promise: "TASK COMPLETE",
            reflect: false,
            follow_ups: None,
        }
    }

    #[test]
    fn checklist_counts_items() {
        let task = "# T\n- [x] one\n- [ ] two\n  * [X] nested\n+ [ ] three\nnot - [ ] an item";
        let checklist = Checklist::parse(task);
        assert_eq!(checklist, Checklist { done: 2, open: 2 });
        assert!(!checklist.is_complete());
    }

    #[test]
    fn checklist_without_items_is_not_complete() {
        assert!(!Checklist::parse("just prose").is_complete());
        assert!(Checklist::parse("- [x] done\n- [X] also").is_complete());
    }

    #[test]
    fn template_has_an_open_item() {
        assert_eq!(Checklist::parse(TASK_TEMPLATE).open, 1);
    }

    #[test]
    fn reflection_schedule() {
        assert!(!reflection_due(1, 0));
        assert!(!reflection_due(3, 0));
        assert!(reflection_due(1, 1));
        assert!(!reflection_due(2, 3));
        assert!(reflection_due(3, 3));
        assert!(reflection_due(6, 3));
    }

    #[test]
    fn prompt_contains_task_and_promise() {
        let prompt = compose_prompt(&parts("write hello.txt"));
        assert!(prompt.starts_with("Iteration 2 of 5."));
        assert!(prompt.contains("write hello.txt"));
        assert!(prompt.ends_with("<promise>TASK COMPLETE</promise>."));
        assert!(!prompt.contains("## Reflection"));
        assert!(!prompt.contains("Operator follow-up"));
    }

    #[test]
    fn reflection_is_prepended() {
        let mut p = parts("task");
        p.reflect = true;
        let prompt = compose_prompt(&p);
        assert!(prompt.starts_with("## Reflection"));
    }

    #[test]
    fn follow_ups_come_after_the_task() {
        let mut p = parts("the task");
        p.follow_ups = Some("A\n\nB");
        let prompt = compose_prompt(&p);
        let task_at = prompt.find("the task").unwrap();
        let follow_at = prompt.find("## Operator follow-up").unwrap();
        assert!(task_at < follow_at);
        assert!(prompt.find('A').unwrap() < prompt.rfind('B').unwrap());
    }

    #[test]
    fn promise_regex_tolerates_whitespace() {
        let re = promise_regex("TASK COMPLETE");
        assert!(re.is_match("done <promise>TASK COMPLETE</promise>"));
        assert!(re.is_match("<promise>\n TASK COMPLETE \n</promise>"));
        assert!(!re.is_match("<promise>TASK</promise>"));
        assert!(promise_regex("a.b").is_match("<promise>a.b</promise>"));
        assert!(!promise_regex("a.b").is_match("<promise>axb</promise>"));
    }
}
