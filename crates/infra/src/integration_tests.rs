//! Integration tests for the full receiving pipeline.
//!
//! Service → CommandDispatcher → EventStore → EventBus → effects worker →
//! inventory collaborator.
//!
//! Verifies:
//! - receipts and lifecycle steps reach inventory with the right movements
//! - tenant isolation is preserved
//! - concurrent receives on one parent produce exactly one winner
//! - shipment operations interleaving with each other keep the shipment and
//!   its transfer in lockstep
//! - a storage failure leaves the batch unapplied

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;
    use serde_json::Value as JsonValue;

    use procura_core::{AggregateId, ExpectedVersion, TenantId};
    use procura_events::{EventEnvelope, InMemoryEventBus};
    use procura_purchasing::{PurchaseOrderId, PurchaseOrderStatus, SupplierId};
    use procura_receiving::{Adjustment, LineId, LocationId, NewLine, ProductId};
    use procura_transfers::{ShipmentId, ShipmentStatus, Transfer, TransferId, TransferStatus};

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::config::ReceivingConfig;
    use crate::event_store::{
        EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
    };
    use crate::inventory_effects::{InMemoryInventoryLocations, InventoryEffects, InventoryLocations};
    use crate::receiving_service::ReceivingService;
    use crate::shipment_coordinator::ShipmentCoordinator;
    use crate::workers::{WorkerHandle, spawn_inventory_effects};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Pipeline<S> {
        tenant_id: TenantId,
        service: ReceivingService<Arc<S>, Bus>,
        coordinator: ShipmentCoordinator<Arc<S>, Bus>,
        inventory: Arc<InMemoryInventoryLocations>,
        worker: Option<WorkerHandle>,
    }

    impl<S: EventStore + 'static> Pipeline<S> {
        fn new(store: Arc<S>) -> Self {
            let config = ReceivingConfig::default().with_effects_poll(Duration::from_millis(10));
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let inventory = Arc::new(InMemoryInventoryLocations::new());

            // Subscribe before any command runs so no event is missed.
            let effects = Arc::new(InventoryEffects::new(inventory.clone()));
            let worker = spawn_inventory_effects(&bus, effects, &config).unwrap();

            let dispatcher = Arc::new(CommandDispatcher::new(store, bus));
            Self {
                tenant_id: TenantId::new(),
                service: ReceivingService::new(dispatcher.clone(), config.clone()),
                coordinator: ShipmentCoordinator::new(dispatcher, config),
                inventory,
                worker: Some(worker),
            }
        }

        fn placed_order(&self, destination: LocationId, lines: &[(ProductId, i64)]) -> PurchaseOrderId {
            let id = self
                .service
                .create_purchase_order(self.tenant_id, SupplierId::generate(), destination, new_lines(lines))
                .unwrap();
            self.service.mark_ordered(self.tenant_id, id).unwrap();
            id
        }

        fn ready_transfer(&self, quantities: &[i64]) -> TransferId {
            let lines: Vec<_> = quantities.iter().map(|q| (ProductId::generate(), *q)).collect();
            let id = self
                .service
                .create_transfer(self.tenant_id, LocationId::generate(), LocationId::generate(), new_lines(&lines))
                .unwrap();
            self.service.mark_ready_to_ship(self.tenant_id, id).unwrap();
            id
        }

        fn pending_shipment(&self, transfer_id: TransferId) -> ShipmentId {
            self.coordinator
                .create_shipment(self.tenant_id, transfer_id, None, None)
                .unwrap()
        }

        fn shipment_in_transit(&self, quantities: &[i64]) -> (TransferId, ShipmentId) {
            let transfer_id = self.ready_transfer(quantities);
            let shipment_id = self.pending_shipment(transfer_id);
            self.coordinator.mark_in_transit(self.tenant_id, shipment_id).unwrap();
            (transfer_id, shipment_id)
        }

        /// Poll the inventory until `check` holds (the worker is asynchronous).
        fn eventually(&self, location: LocationId, product: ProductId, check: impl Fn(&crate::StockLevel) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let level = self.inventory.level(self.tenant_id, location, product);
                if check(&level) {
                    return;
                }
                assert!(Instant::now() < deadline, "inventory never converged: {level:?}");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl<S> Drop for Pipeline<S> {
        fn drop(&mut self) {
            if let Some(worker) = self.worker.take() {
                worker.shutdown();
            }
        }
    }

    fn new_lines(lines: &[(ProductId, i64)]) -> Vec<NewLine> {
        lines
            .iter()
            .map(|(product_id, quantity)| NewLine {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect()
    }

    #[test]
    fn partial_then_final_receipt_closes_order_and_stocks_destination() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        let (dest, product) = (LocationId::generate(), ProductId::generate());
        let order_id = p.placed_order(dest, &[(product, 10)]);

        let first = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 6)])
            .unwrap();
        assert_eq!(first.status, PurchaseOrderStatus::PartiallyReceived);
        assert_eq!(first.remaining[0].remaining, 4);

        let second = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 4)])
            .unwrap();
        assert_eq!(second.status, PurchaseOrderStatus::Received);
        assert_eq!(second.remaining[0].remaining, 0);

        p.eventually(dest, product, |l| l.on_hand == 10 && l.available == 10);

        // Terminal parent: further receipts are InvalidState, not a no-op.
        let err = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 0)])
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }

    #[test]
    fn rejected_units_never_reach_inventory() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        let (dest, product) = (LocationId::generate(), ProductId::generate());
        let order_id = p.placed_order(dest, &[(product, 5)]);

        let outcome = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::new(LineId(1), 3, 2)])
            .unwrap();
        assert_eq!(outcome.status, PurchaseOrderStatus::Received);

        p.eventually(dest, product, |l| l.on_hand == 3);
        assert_eq!(p.inventory.level(p.tenant_id, dest, product).available, 3);
    }

    #[test]
    fn transfer_moves_stock_from_origin_to_destination() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        let (origin, dest) = (LocationId::generate(), LocationId::generate());
        let product = ProductId::generate();

        // Stock the origin through a purchase order first.
        let order_id = p.placed_order(origin, &[(product, 8)]);
        p.service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 8)])
            .unwrap();
        p.eventually(origin, product, |l| l.available == 8);

        let transfer_id = p
            .service
            .create_transfer(p.tenant_id, origin, dest, new_lines(&[(product, 5)]))
            .unwrap();
        p.service.mark_ready_to_ship(p.tenant_id, transfer_id).unwrap();
        p.eventually(origin, product, |l| l.available == 3 && l.unavailable == 5);

        let shipment_id = p
            .coordinator
            .create_shipment(p.tenant_id, transfer_id, Some("DHL".into()), Some("1Z999".into()))
            .unwrap();
        let transit = p.coordinator.mark_in_transit(p.tenant_id, shipment_id).unwrap();
        assert_eq!(transit.transfer, TransferStatus::InProgress);
        p.eventually(origin, product, |l| l.unavailable == 0 && l.on_hand == 3);
        p.eventually(dest, product, |l| l.incoming == 5);

        let receipt = p
            .coordinator
            .receive(p.tenant_id, shipment_id, vec![Adjustment::new(LineId(1), 4, 1)])
            .unwrap();
        assert_eq!(receipt.shipment.status(), ShipmentStatus::Received);
        assert_eq!(receipt.transfer.status, TransferStatus::Transferred);

        p.eventually(dest, product, |l| l.incoming == 0 && l.on_hand == 4 && l.available == 4);
        assert_eq!(p.inventory.level(p.tenant_id, origin, product).available, 3);
    }

    #[test]
    fn cancelling_a_ready_transfer_releases_the_reservation() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        let (origin, product) = (LocationId::generate(), ProductId::generate());
        let transfer_id = p
            .service
            .create_transfer(p.tenant_id, origin, LocationId::generate(), new_lines(&[(product, 2)]))
            .unwrap();
        p.service.mark_ready_to_ship(p.tenant_id, transfer_id).unwrap();
        p.eventually(origin, product, |l| l.unavailable == 2);

        p.service.cancel_transfer(p.tenant_id, transfer_id).unwrap();
        p.eventually(origin, product, |l| l.unavailable == 0 && l.available == 0);
    }

    #[test]
    fn tenants_cannot_receive_each_others_orders() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        let (dest, product) = (LocationId::generate(), ProductId::generate());
        let order_id = p.placed_order(dest, &[(product, 3)]);

        let err = p
            .service
            .receive_purchase_order(TenantId::new(), order_id, vec![Adjustment::accept(LineId(1), 1)])
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));

        let order = p.service.purchase_order(p.tenant_id, order_id).unwrap();
        assert_eq!(order.ledger().total_remaining(), 3);
    }

    #[test]
    fn unknown_transfer_is_not_found() {
        let p = Pipeline::new(Arc::new(InMemoryEventStore::new()));
        assert!(matches!(
            p.service.mark_ready_to_ship(p.tenant_id, TransferId::generate()),
            Err(DispatchError::NotFound(_))
        ));
    }

    /// Holds every `load_stream` call on the armed stream until `parties`
    /// callers have loaded it, so all of them validate against the same
    /// version.
    struct RendezvousStore {
        inner: InMemoryEventStore,
        barrier: Barrier,
        armed: Mutex<Option<AggregateId>>,
    }

    impl RendezvousStore {
        fn new(parties: usize) -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                barrier: Barrier::new(parties),
                armed: Mutex::new(None),
            }
        }

        fn arm(&self, aggregate_id: AggregateId) {
            *self.armed.lock().unwrap() = Some(aggregate_id);
        }

        fn disarm(&self) {
            *self.armed.lock().unwrap() = None;
        }
    }

    impl EventStore for RendezvousStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.append(events, expected_version)
        }

        fn load_stream(
            &self,
            tenant_id: TenantId,
            aggregate_id: AggregateId,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            let stream = self.inner.load_stream(tenant_id, aggregate_id)?;
            let armed = *self.armed.lock().unwrap() == Some(aggregate_id);
            if armed {
                self.barrier.wait();
            }
            Ok(stream)
        }
    }

    /// Two receives that are each valid but jointly overshoot: one commits,
    /// the other gets a retryable conflict.
    fn race(ordered: i64, first: i64, second: i64) -> (Vec<Result<(), DispatchError>>, i64) {
        let store = Arc::new(RendezvousStore::new(2));
        let p = Arc::new(Pipeline::new(store.clone()));
        let order_id = p.placed_order(LocationId::generate(), &[(ProductId::generate(), ordered)]);

        store.arm(order_id.0);
        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|accept| {
                let p = p.clone();
                thread::spawn(move || {
                    p.service
                        .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), accept)])
                        .map(|_| ())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        store.disarm();

        let order = p.service.purchase_order(p.tenant_id, order_id).unwrap();
        (results, order.ledger().total_remaining())
    }

    #[test]
    fn concurrent_overshooting_receives_have_one_winner() {
        let (results, remaining) = race(10, 6, 6);

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.into_iter().find_map(Result::err).unwrap();
        assert!(matches!(loser, DispatchError::Concurrency(_)));
        assert!(loser.is_retryable());
        assert_eq!(remaining, 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 16,
            ..ProptestConfig::default()
        })]

        /// Property: for any pair of receives each within capacity but
        /// jointly over it, exactly one commits and the ledger reflects only
        /// the winner.
        #[test]
        fn racing_receives_never_overshoot(
            (ordered, first, second) in (2i64..40).prop_flat_map(|o| {
                (Just(o), 1..=o, 1..=o).prop_filter("jointly overshooting", move |(_, a, b)| a + b > o)
            })
        ) {
            let (results, remaining) = race(ordered, first, second);

            prop_assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            prop_assert!(results.iter().any(|r| matches!(r, Err(DispatchError::Concurrency(_)))));
            let winner = if results[0].is_ok() { first } else { second };
            prop_assert_eq!(remaining, ordered - winner);
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum ShipmentOp {
        Receive(i64),
        Cancel,
    }

    /// Runs two operations on one in-transit shipment, both of which load the
    /// transfer at the same version before either writes.
    fn race_shipment(ordered: i64, ops: [ShipmentOp; 2]) -> (Vec<Result<(), DispatchError>>, ShipmentStatus, Transfer) {
        let store = Arc::new(RendezvousStore::new(2));
        let p = Arc::new(Pipeline::new(store.clone()));
        let (transfer_id, shipment_id) = p.shipment_in_transit(&[ordered]);

        store.arm(transfer_id.0);
        let handles: Vec<_> = ops
            .into_iter()
            .map(|op| {
                let p = p.clone();
                thread::spawn(move || match op {
                    ShipmentOp::Receive(accept) => p
                        .coordinator
                        .receive(p.tenant_id, shipment_id, vec![Adjustment::accept(LineId(1), accept)])
                        .map(|_| ()),
                    ShipmentOp::Cancel => p.coordinator.cancel_shipment(p.tenant_id, shipment_id).map(|_| ()),
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        store.disarm();

        let shipment = p.coordinator.shipment(p.tenant_id, shipment_id).unwrap();
        let transfer = p.service.transfer(p.tenant_id, transfer_id).unwrap();
        (results, shipment.status(), transfer)
    }

    #[test]
    fn concurrent_shipment_receipts_have_one_winner() {
        let (results, shipment, transfer) =
            race_shipment(10, [ShipmentOp::Receive(6), ShipmentOp::Receive(6)]);

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(DispatchError::Concurrency(_)))));
        assert_eq!(shipment, ShipmentStatus::Received);
        assert_eq!(transfer.ledger().total_remaining(), 4);
        assert_eq!(transfer.status(), TransferStatus::InProgress);
    }

    #[test]
    fn receipt_racing_a_cancel_keeps_both_aggregates_in_step() {
        let (results, shipment, transfer) = race_shipment(5, [ShipmentOp::Receive(5), ShipmentOp::Cancel]);

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(DispatchError::Concurrency(_)))));
        assert_eq!(transfer.active_shipment(), None);
        if results[0].is_ok() {
            assert_eq!(shipment, ShipmentStatus::Received);
            assert_eq!(transfer.status(), TransferStatus::Transferred);
        } else {
            assert_eq!(shipment, ShipmentStatus::Cancelled);
            assert_eq!(transfer.status(), TransferStatus::InProgress);
            assert_eq!(transfer.ledger().total_remaining(), 5);
        }
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// Runs a one-shot hook right after the first append that commits an
    /// event of type `trigger`, before the appending call returns.
    struct HookStore {
        inner: InMemoryEventStore,
        trigger: &'static str,
        hook: Mutex<Option<Hook>>,
    }

    impl HookStore {
        fn new(trigger: &'static str) -> Self {
            Self {
                inner: InMemoryEventStore::new(),
                trigger,
                hook: Mutex::new(None),
            }
        }

        /// Install `run` as the hook; its result lands in the returned slot.
        fn interleave<T: Send + 'static>(&self, run: impl FnOnce() -> T + Send + 'static) -> Arc<Mutex<Option<T>>> {
            let slot = Arc::new(Mutex::new(None));
            let out = slot.clone();
            *self.hook.lock().unwrap() = Some(Box::new(move || {
                let result = run();
                *out.lock().unwrap() = Some(result);
            }));
            slot
        }
    }

    impl EventStore for HookStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            let committed = self.inner.append(events, expected_version)?;
            if committed.iter().any(|e| e.event_type == self.trigger) {
                let hook = self.hook.lock().unwrap().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            Ok(committed)
        }

        fn load_stream(
            &self,
            tenant_id: TenantId,
            aggregate_id: AggregateId,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(tenant_id, aggregate_id)
        }
    }

    #[test]
    fn cancel_between_receipt_steps_is_refused() {
        let store = Arc::new(HookStore::new("transfers.transfer.received"));
        let p = Arc::new(Pipeline::new(store.clone()));
        let (transfer_id, shipment_id) = p.shipment_in_transit(&[5]);

        let cancel = {
            let p = p.clone();
            store.interleave(move || p.coordinator.cancel_shipment(p.tenant_id, shipment_id))
        };
        let receipt = p
            .coordinator
            .receive(p.tenant_id, shipment_id, vec![Adjustment::accept(LineId(1), 5)])
            .unwrap();

        let cancel = cancel.lock().unwrap().take().unwrap();
        assert!(matches!(cancel, Err(DispatchError::InvalidState(_))));
        assert_eq!(receipt.shipment.status(), ShipmentStatus::Received);
        assert_eq!(receipt.transfer.status, TransferStatus::Transferred);

        let shipment = p.coordinator.shipment(p.tenant_id, shipment_id).unwrap();
        assert_eq!(shipment.status(), ShipmentStatus::Received);
        let transfer = p.service.transfer(p.tenant_id, transfer_id).unwrap();
        assert_eq!(transfer.ledger().total_remaining(), 0);
    }

    #[test]
    fn receipt_between_cancel_steps_is_refused() {
        let store = Arc::new(HookStore::new("transfers.transfer.shipment_detached"));
        let p = Arc::new(Pipeline::new(store.clone()));
        let (transfer_id, shipment_id) = p.shipment_in_transit(&[5]);

        let receive = {
            let p = p.clone();
            store.interleave(move || {
                p.coordinator
                    .receive(p.tenant_id, shipment_id, vec![Adjustment::accept(LineId(1), 2)])
                    .map(|r| r.transfer.status)
            })
        };
        let status = p.coordinator.cancel_shipment(p.tenant_id, shipment_id).unwrap();
        assert_eq!(status, ShipmentStatus::Cancelled);

        let receive = receive.lock().unwrap().take().unwrap();
        assert!(matches!(receive, Err(DispatchError::InvalidState(_))));

        let transfer = p.service.transfer(p.tenant_id, transfer_id).unwrap();
        assert_eq!(transfer.status(), TransferStatus::InProgress);
        assert_eq!(transfer.active_shipment(), None);
        assert_eq!(transfer.ledger().total_remaining(), 5);
    }

    #[test]
    fn cancel_between_dispatch_steps_is_a_conflict() {
        let store = Arc::new(HookStore::new("transfers.transfer.dispatched"));
        let p = Arc::new(Pipeline::new(store.clone()));
        let transfer_id = p.ready_transfer(&[3]);
        let shipment_id = p.pending_shipment(transfer_id);

        let cancel = {
            let p = p.clone();
            store.interleave(move || p.coordinator.cancel_shipment(p.tenant_id, shipment_id))
        };
        let transit = p.coordinator.mark_in_transit(p.tenant_id, shipment_id).unwrap();
        assert_eq!(transit.shipment, ShipmentStatus::InTransit);
        assert_eq!(transit.transfer, TransferStatus::InProgress);

        let cancel = cancel.lock().unwrap().take().unwrap();
        assert!(matches!(cancel, Err(DispatchError::Conflict(_))));
        let transfer = p.service.transfer(p.tenant_id, transfer_id).unwrap();
        assert_eq!(transfer.active_shipment(), Some(shipment_id));

        // Re-reading the shipment lets the cancel through.
        assert_eq!(
            p.coordinator.cancel_shipment(p.tenant_id, shipment_id).unwrap(),
            ShipmentStatus::Cancelled
        );
    }

    /// Fails every append while `failing` is set.
    struct FlakyStore {
        inner: InMemoryEventStore,
        failing: AtomicBool,
    }

    impl EventStore for FlakyStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EventStoreError::Storage("disk full".to_string()));
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(
            &self,
            tenant_id: TenantId,
            aggregate_id: AggregateId,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(tenant_id, aggregate_id)
        }
    }

    #[test]
    fn storage_failure_leaves_the_batch_unapplied() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryEventStore::new(),
            failing: AtomicBool::new(false),
        });
        let p = Pipeline::new(store.clone());
        let (dest, product) = (LocationId::generate(), ProductId::generate());
        let order_id = p.placed_order(dest, &[(product, 10)]);

        store.failing.store(true, Ordering::SeqCst);
        let err = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 6)])
            .unwrap_err();
        assert!(matches!(err, DispatchError::Store(EventStoreError::Storage(_))));
        assert!(!err.is_retryable());
        store.failing.store(false, Ordering::SeqCst);

        let order = p.service.purchase_order(p.tenant_id, order_id).unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Ordered);
        assert_eq!(order.ledger().total_remaining(), 10);

        // Re-submitting after a failure is safe.
        let outcome = p
            .service
            .receive_purchase_order(p.tenant_id, order_id, vec![Adjustment::accept(LineId(1), 6)])
            .unwrap();
        assert_eq!(outcome.remaining[0].remaining, 4);
    }
}
