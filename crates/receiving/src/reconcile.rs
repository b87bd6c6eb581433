//! Batch reconciliation: validate a whole receive request against a ledger
//! and produce the ledger it would leave behind.
//!
//! The batch is all-or-nothing. Validation runs against a copy of the ledger,
//! so the caller's ledger is never touched; the caller commits the returned
//! [`Reconciliation`] only if every line passed.

use core::fmt::Display;

use serde::{Deserialize, Serialize};

use procura_core::{DomainError, DomainResult, ValueObject};

use crate::closure::{Closure, LineRemaining};
use crate::ledger::LineLedger;
use crate::line::{LineId, ProductId};

/// One requested line movement: `accept` units into stock, `reject` units dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub line_id: LineId,
    pub accept: i64,
    pub reject: i64,
}

impl Adjustment {
    pub fn accept(line_id: LineId, accept: i64) -> Self {
        Self {
            line_id,
            accept,
            reject: 0,
        }
    }

    pub fn new(line_id: LineId, accept: i64, reject: i64) -> Self {
        Self {
            line_id,
            accept,
            reject,
        }
    }
}

impl ValueObject for Adjustment {}

/// What a committed batch did to one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceipt {
    pub line_id: LineId,
    pub product_id: ProductId,
    pub accepted: i64,
    pub rejected: i64,
}

/// A validated batch: per-line receipts plus the resulting ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub receipts: Vec<LineReceipt>,
    pub ledger: LineLedger,
}

impl Reconciliation {
    pub fn closure(&self) -> Closure {
        self.ledger.closure()
    }

    pub fn remaining(&self) -> Vec<LineRemaining> {
        self.ledger.remaining()
    }
}

/// Validate `adjustments` against `ledger` for the parent named by `parent`.
///
/// Order of checks: empty batch, unknown line ids, negative quantities, then
/// capacity. Adjustments naming the same line are summed before the capacity
/// check, so splitting an overshoot across entries does not get through.
pub fn reconcile<P: Display>(
    parent: P,
    ledger: &LineLedger,
    adjustments: &[Adjustment],
) -> DomainResult<Reconciliation> {
    if adjustments.is_empty() {
        return Err(DomainError::validation(format!(
            "{parent}: receive batch is empty"
        )));
    }

    if let Some(unknown) = adjustments.iter().find(|a| ledger.get(a.line_id).is_none()) {
        return Err(DomainError::not_found(format!(
            "{parent}: line {}",
            unknown.line_id
        )));
    }

    if let Some(bad) = adjustments.iter().find(|a| a.accept < 0 || a.reject < 0) {
        return Err(DomainError::invariant(format!(
            "{parent}: line {}: accept and reject must be non-negative (accept {}, reject {})",
            bad.line_id, bad.accept, bad.reject
        )));
    }

    let merged = merge_by_line(&parent, adjustments)?;

    let mut next = ledger.clone();
    let mut receipts = Vec::with_capacity(merged.len());
    for adj in merged {
        next.apply_delta(adj.line_id, adj.accept, adj.reject)
            .map_err(|e| scoped(&parent, e))?;

        if adj.accept == 0 && adj.reject == 0 {
            continue;
        }
        if let Some(line) = next.get(adj.line_id) {
            receipts.push(LineReceipt {
                line_id: adj.line_id,
                product_id: line.product_id(),
                accepted: adj.accept,
                rejected: adj.reject,
            });
        }
    }

    Ok(Reconciliation {
        receipts,
        ledger: next,
    })
}

/// Sum adjustments per line, keeping first-seen order.
fn merge_by_line<P: Display>(parent: &P, adjustments: &[Adjustment]) -> DomainResult<Vec<Adjustment>> {
    let mut merged: Vec<Adjustment> = Vec::with_capacity(adjustments.len());
    for adj in adjustments {
        match merged.iter_mut().find(|m| m.line_id == adj.line_id) {
            Some(existing) => {
                existing.accept = existing.accept.checked_add(adj.accept).ok_or_else(|| {
                    DomainError::invariant(format!("{parent}: line {}: quantity overflow", adj.line_id))
                })?;
                existing.reject = existing.reject.checked_add(adj.reject).ok_or_else(|| {
                    DomainError::invariant(format!("{parent}: line {}: quantity overflow", adj.line_id))
                })?;
            }
            None => merged.push(*adj),
        }
    }
    Ok(merged)
}

fn scoped<P: Display>(parent: &P, err: DomainError) -> DomainError {
    match err {
        DomainError::InvariantViolation(msg) => DomainError::invariant(format!("{parent}: {msg}")),
        DomainError::NotFound(msg) => DomainError::not_found(format!("{parent}: {msg}")),
        DomainError::Validation(msg) => DomainError::validation(format!("{parent}: {msg}")),
        other => other,
    }
}
