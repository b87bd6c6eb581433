use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use procura_core::TenantId;
use procura_events::{EventBus, EventEnvelope, Subscription, TenantScoped};

use crate::config::ReceivingConfig;
use crate::inventory_effects::{InventoryEffects, InventoryLocations};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic bus-consuming worker loop.
///
/// Handler failures are logged and the message is dropped; outbound effects
/// are fire-and-forget from the engine's point of view.
#[derive(Debug)]
pub struct EffectsWorker;

impl EffectsWorker {
    /// Spawn a worker thread that processes messages from a bus subscription.
    ///
    /// The subscription is taken before this returns, so nothing published
    /// afterwards is missed.
    ///
    /// - `tenant_id`: when provided, messages for other tenants are ignored
    /// - `poll`: how long to block on the bus before checking for shutdown
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: &B,
        tenant_id: Option<TenantId>,
        poll: Duration,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        M: TenantScoped + Send + 'static,
        B: EventBus<M>,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, tenant_id, poll, &mut handler))?;

        info!(worker = name, "worker started");
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Spawn the worker that feeds committed events into the inventory collaborator.
pub fn spawn_inventory_effects<B, L>(
    bus: &B,
    effects: Arc<InventoryEffects<L>>,
    config: &ReceivingConfig,
) -> io::Result<WorkerHandle>
where
    B: EventBus<EventEnvelope<JsonValue>>,
    L: InventoryLocations + 'static,
{
    EffectsWorker::spawn(
        "inventory-effects",
        bus,
        None,
        config.effects_poll(),
        move |env: EventEnvelope<JsonValue>| effects.apply_envelope(&env),
    )
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    tenant_id: Option<TenantId>,
    poll: Duration,
    handler: &mut H,
) where
    M: TenantScoped,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Display,
{
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(poll) {
            Ok(msg) => {
                if let Some(t) = tenant_id {
                    if msg.tenant_id() != t {
                        continue;
                    }
                }

                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = %err, "side effect failed; not retried");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, "worker stopped");
}
