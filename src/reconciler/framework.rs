//! Reconciliation framework: owns the engine set, its indexes, and the
//! merged event stream.
//!
//! Ownership is one-way: the framework exclusively owns engines; an engine
//! has no pointer back. Cross-engine queries (find by child id, ordered
//! views) live here alone. The main loop is single-threaded; the engine
//! set and indexes are mutated only by it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::error::ReconcileError;
use crate::domain::models::{EntityHolder, ReconcileEvent};
use crate::domain::ports::{Clock, JobStore, OfferSource};

use super::engine::ReconciliationEngine;
use super::job_actions::TaskLifecycleListener;

const MERGED_CHANNEL_CAPACITY: usize = 4096;

/// Loop pacing. The loop sleeps `active_timeout_ms` while any engine has
/// pending actions and `idle_timeout_ms` otherwise.
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    pub active_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            active_timeout_ms: 50,
            idle_timeout_ms: 500,
        }
    }
}

impl FrameworkConfig {
    /// Requires `0 < active_timeout_ms <= idle_timeout_ms`.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.active_timeout_ms == 0 {
            return Err(ReconcileError::InvalidInput(
                "active_timeout_ms must be positive".to_string(),
            ));
        }
        if self.active_timeout_ms > self.idle_timeout_ms {
            return Err(ReconcileError::InvalidInput(format!(
                "active_timeout_ms ({}) must be <= idle_timeout_ms ({})",
                self.active_timeout_ms, self.idle_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Sort order for [`ReconciliationFramework::ordered_view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCriterion {
    RootId,
    /// Most children first; root id breaks ties.
    ChildCount,
}

#[derive(Default)]
struct Indexes {
    by_root: HashMap<String, Arc<ReconciliationEngine>>,
    root_by_child: HashMap<String, String>,
}

struct AddRequest {
    engine: Arc<ReconciliationEngine>,
    ack: oneshot::Sender<Result<Arc<ReconciliationEngine>, ReconcileError>>,
}

struct RemoveRequest {
    root_id: String,
    ack: oneshot::Sender<Result<(), ReconcileError>>,
}

/// Owns the reconciliation engines and multiplexes their event streams.
pub struct ReconciliationFramework {
    config: FrameworkConfig,
    store: Arc<dyn JobStore>,
    offer_source: Arc<dyn OfferSource>,
    listener: Arc<dyn TaskLifecycleListener>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    add_tx: mpsc::UnboundedSender<AddRequest>,
    remove_tx: mpsc::UnboundedSender<RemoveRequest>,
    queues: Mutex<Option<(mpsc::UnboundedReceiver<AddRequest>, mpsc::UnboundedReceiver<RemoveRequest>)>>,
    indexes: Arc<RwLock<Indexes>>,
    merged_tx: broadcast::Sender<ReconcileEvent>,
    runnable: Arc<AtomicBool>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ReconciliationFramework {
    pub fn new(
        config: FrameworkConfig,
        store: Arc<dyn JobStore>,
        offer_source: Arc<dyn OfferSource>,
        listener: Arc<dyn TaskLifecycleListener>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Result<Self, ReconcileError> {
        config.validate()?;
        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let (merged_tx, _) = broadcast::channel(MERGED_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            store,
            offer_source,
            listener,
            clock,
            store_timeout,
            add_tx,
            remove_tx,
            queues: Mutex::new(Some((add_rx, remove_rx))),
            indexes: Arc::new(RwLock::new(Indexes::default())),
            merged_tx,
            runnable: Arc::new(AtomicBool::new(true)),
            done: Mutex::new(None),
        })
    }

    /// Enqueue creation of an engine for `bootstrap`; resolves when the
    /// loop admitted it into the set and rebuilt the indexes.
    pub async fn new_engine(
        &self,
        bootstrap: EntityHolder,
    ) -> Result<Arc<ReconciliationEngine>, ReconcileError> {
        if !self.runnable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ShutdownInProgress);
        }
        let engine = Arc::new(ReconciliationEngine::new(
            bootstrap,
            self.store.clone(),
            self.offer_source.clone(),
            self.listener.clone(),
            self.clock.clone(),
            self.store_timeout,
        ));
        let (ack, rx) = oneshot::channel();
        self.add_tx
            .send(AddRequest { engine, ack })
            .map_err(|_| ReconcileError::ShutdownInProgress)?;
        rx.await
            .map_err(|_| ReconcileError::ShutdownInProgress)?
    }

    /// Enqueue removal; the loop shuts the engine down and drops it from
    /// the indexes before acknowledging.
    pub async fn remove_engine(&self, root_id: &str) -> Result<(), ReconcileError> {
        if !self.runnable.load(Ordering::SeqCst) {
            return Err(ReconcileError::ShutdownInProgress);
        }
        let (ack, rx) = oneshot::channel();
        self.remove_tx
            .send(RemoveRequest {
                root_id: root_id.to_string(),
                ack,
            })
            .map_err(|_| ReconcileError::ShutdownInProgress)?;
        rx.await
            .map_err(|_| ReconcileError::ShutdownInProgress)?
    }

    /// Merged stream of all current engines' events. Subscribing after an
    /// engine has started does not replay its past events.
    pub fn events(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.merged_tx.subscribe()
    }

    pub fn find_engine_by_root_id(&self, root_id: &str) -> Option<Arc<ReconciliationEngine>> {
        let indexes = self.indexes.read().expect("index lock poisoned");
        indexes.by_root.get(root_id).cloned()
    }

    pub fn find_engine_by_child_id(&self, child_id: &str) -> Option<Arc<ReconciliationEngine>> {
        let indexes = self.indexes.read().expect("index lock poisoned");
        let root = indexes.root_by_child.get(child_id)?;
        indexes.by_root.get(root).cloned()
    }

    /// Engines ordered by the given criterion.
    pub fn ordered_view(&self, criterion: OrderCriterion) -> Vec<Arc<ReconciliationEngine>> {
        let indexes = self.indexes.read().expect("index lock poisoned");
        let mut engines: Vec<_> = indexes.by_root.values().cloned().collect();
        match criterion {
            OrderCriterion::RootId => {
                engines.sort_by(|a, b| a.root_id().cmp(b.root_id()));
            }
            OrderCriterion::ChildCount => {
                engines.sort_by(|a, b| {
                    b.child_ids()
                        .len()
                        .cmp(&a.child_ids().len())
                        .then_with(|| a.root_id().cmp(b.root_id()))
                });
            }
        }
        engines
    }

    /// Start the framework loop. Call once.
    pub fn start(&self) -> JoinHandle<()> {
        let (add_rx, remove_rx) = self
            .queues
            .lock()
            .expect("framework lock poisoned")
            .take()
            .expect("framework already started");
        let (done_tx, done_rx) = oneshot::channel();
        *self.done.lock().expect("framework lock poisoned") = Some(done_rx);

        let core = LoopCore {
            config: self.config.clone(),
            indexes: self.indexes.clone(),
            merged_tx: self.merged_tx.clone(),
            runnable: self.runnable.clone(),
        };
        tokio::spawn(async move {
            core.run(add_rx, remove_rx).await;
            let _ = done_tx.send(());
        })
    }

    /// Signal shutdown and wait (bounded) for the loop to drain engines.
    /// Returns false when the wait timed out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.runnable.store(false, Ordering::SeqCst);
        let done = self.done.lock().expect("framework lock poisoned").take();
        match done {
            Some(rx) => tokio::time::timeout(timeout, rx).await.is_ok(),
            None => true,
        }
    }

}

/// The state the loop task owns: everything it shares with the framework
/// handle travels behind `Arc`s.
struct LoopCore {
    config: FrameworkConfig,
    indexes: Arc<RwLock<Indexes>>,
    merged_tx: broadcast::Sender<ReconcileEvent>,
    runnable: Arc<AtomicBool>,
}

impl LoopCore {
    async fn run(
        &self,
        mut add_rx: mpsc::UnboundedReceiver<AddRequest>,
        mut remove_rx: mpsc::UnboundedReceiver<RemoveRequest>,
    ) {
        info!(
            active_timeout_ms = self.config.active_timeout_ms,
            idle_timeout_ms = self.config.idle_timeout_ms,
            "reconciliation framework started"
        );
        let mut engines: Vec<Arc<ReconciliationEngine>> = Vec::new();

        loop {
            let runnable = self.runnable.load(Ordering::SeqCst);
            let mut changed = false;
            let mut add_acks = Vec::new();
            let mut remove_acks = Vec::new();

            // 1. Drain the add and remove queues.
            while let Ok(request) = add_rx.try_recv() {
                if !runnable {
                    let _ = request.ack.send(Err(ReconcileError::ShutdownInProgress));
                    continue;
                }
                let root_id = request.engine.root_id().to_string();
                if engines.iter().any(|e| e.root_id() == root_id) {
                    let _ = request.ack.send(Err(ReconcileError::InvalidInput(format!(
                        "engine for root {root_id} already exists"
                    ))));
                    continue;
                }
                engines.push(request.engine.clone());
                self.attach_event_forwarder(&request.engine);
                changed = true;
                add_acks.push(request);
            }
            while let Ok(request) = remove_rx.try_recv() {
                match engines.iter().position(|e| e.root_id() == request.root_id) {
                    Some(index) => {
                        let engine = engines.remove(index);
                        engine.shutdown();
                        changed = true;
                        remove_acks.push(request.ack);
                    }
                    None => {
                        let _ = request.ack.send(Err(ReconcileError::InvalidInput(format!(
                            "no engine for root {}",
                            request.root_id
                        ))));
                    }
                }
            }

            // 2. Rebuild indexes before acknowledging waiters.
            if changed {
                self.rebuild_indexes(&engines);
            }

            // 3. Acknowledge.
            for request in add_acks {
                let engine = request.engine.clone();
                let _ = request.ack.send(Ok(engine));
            }
            for ack in remove_acks {
                let _ = ack.send(Ok(()));
            }

            if !runnable {
                for engine in engines.drain(..) {
                    engine.shutdown();
                }
                self.rebuild_indexes(&engines);
                break;
            }

            // 4. Trigger every engine; a failing engine never stops the
            // loop.
            let mut any_updates = false;
            let mut any_running = false;
            for engine in &engines {
                match catch_unwind(AssertUnwindSafe(|| engine.trigger_events())) {
                    Ok(result) => {
                        any_updates |= result.has_model_updates;
                        any_running |= result.running_change_actions;
                    }
                    Err(_) => {
                        error!(root_id = %engine.root_id(), "engine trigger panicked");
                    }
                }
            }

            // 5. Model updates may have moved children between states.
            if any_updates {
                self.rebuild_indexes(&engines);
            }

            // 6. Pace by pending work.
            let sleep_ms = if any_running {
                self.config.active_timeout_ms
            } else {
                self.config.idle_timeout_ms
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        info!("reconciliation framework stopped");
    }

    /// Pump one engine's events into the merged stream. The forwarder task
    /// ends when the engine's stream closes, so a disappearing engine's
    /// channel is unsubscribed cleanly.
    fn attach_event_forwarder(&self, engine: &Arc<ReconciliationEngine>) {
        let mut events = engine.events();
        let merged = self.merged_tx.clone();
        let root_id = engine.root_id().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let _ = merged.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(root_id, skipped, "merged stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn rebuild_indexes(&self, engines: &[Arc<ReconciliationEngine>]) {
        let mut indexes = Indexes::default();
        for engine in engines {
            let root_id = engine.root_id().to_string();
            for child_id in engine.child_ids() {
                indexes.root_by_child.insert(child_id, root_id.clone());
            }
            indexes.by_root.insert(root_id, engine.clone());
        }
        *self.indexes.write().expect("index lock poisoned") = indexes;
    }
}
