use serde::{Deserialize, Serialize};

use procura_core::{DomainError, DomainResult};

use crate::closure::{Closure, LineRemaining};
use crate::line::{LineId, LineItem, NewLine};

/// The lines of one parent aggregate, in creation order.
///
/// Lines are fixed when the ledger is opened; afterwards only their
/// received/rejected counts move.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineLedger {
    lines: Vec<LineItem>,
}

impl LineLedger {
    /// Open a ledger, assigning line ids 1..=n in request order.
    pub fn open(requested: &[NewLine]) -> DomainResult<Self> {
        if requested.is_empty() {
            return Err(DomainError::validation("at least one line is required"));
        }
        let lines = requested
            .iter()
            .enumerate()
            .map(|(idx, req)| LineItem::new(LineId(idx as u32 + 1), req.product_id, req.quantity))
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[LineItem] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, line_id: LineId) -> Option<&LineItem> {
        self.lines.iter().find(|l| l.line_id() == line_id)
    }

    /// Apply one line's delta. Unknown lines are `NotFound`; violations leave
    /// the ledger unchanged.
    pub fn apply_delta(&mut self, line_id: LineId, accept: i64, reject: i64) -> DomainResult<()> {
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.line_id() == line_id)
            .ok_or_else(|| DomainError::not_found(format!("line {line_id}")))?;
        line.apply_delta(accept, reject)
    }

    pub fn closure(&self) -> Closure {
        Closure::of(&self.lines)
    }

    pub fn remaining(&self) -> Vec<LineRemaining> {
        self.lines
            .iter()
            .map(|l| LineRemaining {
                line_id: l.line_id(),
                remaining: l.remaining(),
            })
            .collect()
    }

    /// Total units not yet accepted or rejected, across all lines.
    ///
    /// Each line is bounded by `i64`, their sum is not; it saturates at
    /// `i64::MAX`.
    pub fn total_remaining(&self) -> i64 {
        self.lines
            .iter()
            .map(LineItem::remaining)
            .fold(0i64, i64::saturating_add)
    }
}
