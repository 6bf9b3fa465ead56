//! Interactive loop picker UI.

use inquire::Select;

use crate::error::{Result, ViewerError};
use crate::loops::LoopRun;

/// Select a loop from a list of available loops
pub fn select_loop(loops: Vec<LoopRun>) -> Result<LoopRun> {
    if loops.is_empty() {
        return Err(ViewerError::NoLoopsAvailable("this directory".to_string()));
    }

    let options: Vec<String> = loops.iter().map(option_label).collect();

    let selection = Select::new("Select a loop:", options.clone())
        .with_help_message("↑↓ to move, Enter to select, Esc to cancel")
        .prompt()
        .map_err(|_| ViewerError::UserCancelled)?;

    let index = options
        .iter()
        .position(|o| *o == selection)
        .ok_or(ViewerError::UserCancelled)?;

    loops.into_iter().nth(index).ok_or(ViewerError::UserCancelled)
}

fn option_label(run: &LoopRun) -> String {
    format!(
        "{} ({}, {} iter) - {}",
        run.name(),
        run.status_display(),
        run.current_iteration(),
        truncate(&run.task_preview(), 40)
    )
}

/// Truncate a string to a maximum number of characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
