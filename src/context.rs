//! Context window tracking for one agent instance

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::Message;

/// Tool whose calls count as a task-list update
pub const TODO_TOOL: &str = "todo_write";

/// Characters of a tool result kept when it is compressed
const COMPRESSED_PREVIEW_CHARS: usize = 200;

/// What the instance must do after observing a model response
#[derive(Debug, Default, PartialEq)]
pub struct ContextActions {
    /// Thresholds crossed for the first time, ascending
    pub warnings: Vec<u8>,
    pub compress: bool,
}

/// Per-instance context record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    warned: BTreeSet<u8>,
    compressed: bool,
    last_todo_update: Option<usize>,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage as a whole percentage of the window, capped at 100
    pub fn usage_percent(input_tokens: u64, context_window: u64) -> u8 {
        if context_window == 0 {
            return 100;
        }
        (input_tokens.saturating_mul(100) / context_window).min(100) as u8
    }

    /// Record a usage reading. Each threshold is reported once; compression
    /// is requested at most once per instance.
    pub fn observe(
        &mut self,
        percent: u8,
        thresholds: &[u8],
        compression_threshold: Option<u8>,
    ) -> ContextActions {
        let mut warnings: Vec<u8> = thresholds
            .iter()
            .copied()
            .filter(|t| percent >= *t && self.warned.insert(*t))
            .collect();
        warnings.sort_unstable();

        let compress = match compression_threshold {
            Some(t) if percent >= t && !self.compressed => {
                self.compressed = true;
                true
            }
            _ => false,
        };

        ContextActions { warnings, compress }
    }

    pub fn warned(&self) -> impl Iterator<Item = u8> + '_ {
        self.warned.iter().copied()
    }

    pub fn compressed(&self) -> bool {
        self.compressed
    }

    pub fn mark_todo_update(&mut self, history_index: usize) {
        self.last_todo_update = Some(history_index);
    }

    /// History index of the most recent task-list update
    pub fn last_todo_update(&self) -> Option<usize> {
        self.last_todo_update
    }
}

/// Shorten tool results older than the last `keep_recent` messages.
///
/// Returns how many messages were shortened.
pub fn compress_history(history: &mut [Message], keep_recent: usize) -> usize {
    let cutoff = history.len().saturating_sub(keep_recent);
    let mut shortened = 0;

    for message in &mut history[..cutoff] {
        if !message.is_tool_result() || message.content.chars().count() <= COMPRESSED_PREVIEW_CHARS {
            continue;
        }
        let total = message.content.chars().count();
        let preview: String = message.content.chars().take(COMPRESSED_PREVIEW_CHARS).collect();
        message.content = format!("{preview}... [compressed, {total} chars]");
        shortened += 1;
    }

    debug!(shortened, cutoff, "Compressed history");
    shortened
}
