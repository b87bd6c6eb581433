use serde::{Deserialize, Serialize};

use procura_core::{DomainError, DomainResult, Entity, typed_aggregate_id};

typed_aggregate_id!(
    /// Product moved by a line item.
    ProductId
);

typed_aggregate_id!(
    /// Stock location (warehouse, store) at either end of a movement.
    LocationId
);

/// Line identifier, unique within its parent aggregate.
///
/// Assigned sequentially (1, 2, ...) when the parent is created.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(pub u32);

impl core::fmt::Display for LineId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested line at creation time (before an id is assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

/// One ordered (or transferred) quantity and what has happened to it so far.
///
/// Invariant: `0 <= received`, `0 <= rejected`, `received + rejected <= ordered`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    id: LineId,
    product_id: ProductId,
    ordered: i64,
    received: i64,
    rejected: i64,
}

impl LineItem {
    pub fn new(id: LineId, product_id: ProductId, ordered: i64) -> DomainResult<Self> {
        if ordered < 0 {
            return Err(DomainError::validation(format!(
                "line {id}: quantity cannot be negative (got {ordered})"
            )));
        }
        Ok(Self {
            id,
            product_id,
            ordered,
            received: 0,
            rejected: 0,
        })
    }

    pub fn line_id(&self) -> LineId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn ordered(&self) -> i64 {
        self.ordered
    }

    pub fn received(&self) -> i64 {
        self.received
    }

    pub fn rejected(&self) -> i64 {
        self.rejected
    }

    pub fn remaining(&self) -> i64 {
        self.ordered - self.received - self.rejected
    }

    pub fn is_closed(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether anything was ever accepted or rejected on this line.
    pub fn is_touched(&self) -> bool {
        self.received + self.rejected > 0
    }

    /// Check an accept/reject pair against this line without mutating it.
    pub fn check_delta(&self, accept: i64, reject: i64) -> DomainResult<()> {
        if accept < 0 || reject < 0 {
            return Err(DomainError::invariant(format!(
                "line {}: accept and reject must be non-negative (accept {accept}, reject {reject})",
                self.id
            )));
        }
        let requested = accept.checked_add(reject).ok_or_else(|| {
            DomainError::invariant(format!("line {}: quantity overflow", self.id))
        })?;
        if requested > self.remaining() {
            return Err(DomainError::invariant(format!(
                "line {}: accept {accept} + reject {reject} exceeds remaining {}",
                self.id,
                self.remaining()
            )));
        }
        Ok(())
    }

    /// Record accepted and rejected units. Fails without mutating on violation.
    pub fn apply_delta(&mut self, accept: i64, reject: i64) -> DomainResult<()> {
        self.check_delta(accept, reject)?;
        self.received += accept;
        self.rejected += reject;
        Ok(())
    }
}

impl Entity for LineItem {
    type Id = LineId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
