//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the aggregate's stream (tenant-scoped)
//!   ↓
//! 2. Rehydrate: apply history to an empty aggregate
//!   ↓
//! 3. Handle: pure decision, produces events or a DomainError
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! Step 4 is the concurrency guard for a receive batch: two requests that both
//! validated against version N race on the append, and only one of them finds
//! the stream still at N. The loser gets [`DispatchError::Concurrency`] and
//! nothing of its batch is stored.
//!
//! This module contains no IO itself; it composes the store and bus traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use procura_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use procura_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure: the stream moved since it was loaded.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Cross-tenant or cross-aggregate stream mixing.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Deterministic conflict reported by the domain (e.g. duplicate creation).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    /// Historical payloads no longer decode into the aggregate's event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    /// The store failed; the batch was not applied.
    #[error(transparent)]
    Store(EventStoreError),

    /// Publication failed after a successful append (events are committed).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// Whether re-running the same request against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::InvalidState(msg) => DispatchError::InvalidState(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::Unauthorized => DispatchError::Unauthorized,
            DomainError::NotFound(msg) => DispatchError::NotFound(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Outcome of a dispatch that also hands back the post-command state.
#[derive(Debug)]
pub struct Dispatched<A> {
    pub aggregate: A,
    pub committed: Vec<StoredEvent>,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Events are persisted before publication, so a failed append publishes
/// nothing. A failed publication surfaces as [`DispatchError::Publish`] with
/// the events already committed (at-least-once delivery).
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command and return the aggregate as it stands after the
    /// committed events, alongside the events themselves.
    ///
    /// `make_aggregate` builds the empty instance history is applied to
    /// (e.g. `|_, id| Transfer::empty(TransferId::new(id))`).
    pub fn dispatch_and_load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: procura_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_type = aggregate_type.into();

        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let loaded_version = stream_version(&history);

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history(&mut aggregate, &history)?;
        debug!(
            %tenant_id,
            %aggregate_id,
            aggregate_type = %aggregate_type,
            version = loaded_version,
            "aggregate rehydrated"
        );

        let decided = aggregate.handle(&command).map_err(|err| {
            debug!(%aggregate_id, error = %err, "command rejected by aggregate");
            DispatchError::from(err)
        })?;
        if decided.is_empty() {
            return Ok(Dispatched {
                aggregate,
                committed: vec![],
            });
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(uncommitted, ExpectedVersion::Exact(loaded_version))
            .map_err(|err| {
                if matches!(err, EventStoreError::Concurrency(_)) {
                    warn!(%tenant_id, %aggregate_id, error = %err, "append lost the version race");
                }
                DispatchError::from(err)
            })?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(Dispatched {
            aggregate,
            committed,
        })
    }

    /// Rehydrate an aggregate without dispatching anything.
    pub fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // A backend returning foreign or out-of-order events must not be trusted.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use procura_core::AggregateRoot;
    use procura_events::InMemoryEventBus;
    use procura_purchasing::{
        CreatePurchaseOrder, PurchaseOrder, PurchaseOrderCommand, PurchaseOrderId, SupplierId,
    };
    use procura_receiving::{LocationId, NewLine, ProductId};

    use crate::aggregate_types;
    use crate::event_store::InMemoryEventStore;

    type Dispatcher = CommandDispatcher<InMemoryEventStore, InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn create_order(tenant_id: TenantId, order_id: PurchaseOrderId) -> PurchaseOrderCommand {
        PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
            tenant_id,
            order_id,
            supplier_id: SupplierId::generate(),
            destination: LocationId::generate(),
            lines: vec![NewLine {
                product_id: ProductId::generate(),
                quantity: 3,
            }],
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn committed_events_carry_the_new_stream_revision() {
        let dispatcher = Dispatcher::new(InMemoryEventStore::new(), InMemoryEventBus::new());
        let tenant_id = TenantId::new();
        let order_id = PurchaseOrderId::generate();

        let created = dispatcher
            .dispatch_and_load(
                tenant_id,
                order_id.0,
                aggregate_types::PURCHASE_ORDER,
                create_order(tenant_id, order_id),
                |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
            )
            .unwrap();
        assert_eq!(created.committed.len(), 1);
        assert_eq!(created.committed[0].sequence_number, 1);
        assert_eq!(created.committed[0].event_type, "purchasing.order.created");
        assert_eq!(created.aggregate.version(), 1);

        let err = dispatcher
            .dispatch_and_load(
                tenant_id,
                order_id.0,
                aggregate_types::PURCHASE_ORDER,
                create_order(tenant_id, order_id),
                |_, id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Conflict(_)));
    }

    #[test]
    fn only_concurrency_is_retryable() {
        assert!(DispatchError::Concurrency("x".into()).is_retryable());
        assert!(!DispatchError::InvariantViolation("x".into()).is_retryable());
        assert!(!DispatchError::Conflict("x".into()).is_retryable());
        assert!(!DispatchError::Store(EventStoreError::Storage("x".into())).is_retryable());
    }

    #[test]
    fn domain_errors_keep_their_category_and_message() {
        let err = DispatchError::from(DomainError::not_found("purchase order 1: line 7"));
        assert!(matches!(err, DispatchError::NotFound(msg) if msg.contains("line 7")));

        let err = DispatchError::from(DomainError::invalid_state("shipment is pending"));
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[test]
    fn store_concurrency_maps_to_dispatch_concurrency() {
        let err = DispatchError::from(EventStoreError::Concurrency("v".into()));
        assert!(matches!(err, DispatchError::Concurrency(_)));
    }
}
