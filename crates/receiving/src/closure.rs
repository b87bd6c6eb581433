use serde::{Deserialize, Serialize};

use crate::line::{LineId, LineItem};

/// Aggregate closure state of a parent's lines, the sole input to status
/// derivation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Closure {
    /// Nothing accepted or rejected on any line, and some line still open.
    Untouched,
    /// At least one line touched, at least one still open.
    Partial,
    /// Every line has `remaining == 0`. Rejected units count as closed.
    Closed,
}

impl Closure {
    pub fn of(lines: &[LineItem]) -> Self {
        if lines.iter().all(LineItem::is_closed) {
            Closure::Closed
        } else if lines.iter().any(LineItem::is_touched) {
            Closure::Partial
        } else {
            Closure::Untouched
        }
    }
}

/// Remaining quantity for one line, reported back to callers after a receipt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRemaining {
    pub line_id: LineId,
    pub remaining: i64,
}
