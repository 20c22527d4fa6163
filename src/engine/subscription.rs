//! Live subscriptions over the aggregated view.
//!
//! ```text
//!  Idle ─▶ Subscribing ─▶ Active ⇄ Recomputing
//!              ▲            │
//!              │ backoff    ▼
//!              └──────── Failed ──(retries exhausted)──▶ stop
//!
//!  cancel() from any state ─▶ Cancelled
//! ```
//!
//! Each subscription runs on its own task and owns its dedup cache. Change
//! events from the per-fixture watches are collected for one debounce window
//! after the first event of a burst; only a batch with at least one novel
//! event triggers a recompute.

use futures_util::stream::{self, SelectAll, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::cell::Cell;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dedup::DedupCache;
use super::fanout::{Aggregation, FanoutAggregator};
use super::date_matcher::MonthDay;
use super::view::{organize, GroupedView};
use crate::db::models::{ChangeEvent, FixtureKey};
use crate::error::{PartialFailure, RepositoryError, SubscriptionError};
use crate::repository::{ChangeStream, Repository};

#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Window over which a burst of change events is coalesced
    pub debounce: Duration,
    pub dedup_capacity: usize,
    /// Consecutive failed attempts tolerated before giving up
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        SubscriptionSettings {
            debounce: Duration::from_millis(500),
            dedup_capacity: 1024,
            max_retries: 5,
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Recomputing,
    Failed,
    Cancelled,
}

/// One emitted view.
#[derive(Debug, Clone, Serialize)]
pub struct ViewUpdate {
    pub target: MonthDay,
    /// Increases by one with every update delivered by this subscription
    pub revision: u64,
    pub view: GroupedView,
    pub partial_failure: Option<PartialFailure>,
}

pub type UpdateFn = Arc<dyn Fn(ViewUpdate) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(SubscriptionError) + Send + Sync>;

enum Command {
    ChangeTarget(MonthDay),
}

/// Why a subscribing/active session ended.
enum Flow {
    Cancelled,
    Retarget(MonthDay),
    Failed(String),
}

thread_local! {
    /// Gate whose callback is running on this thread, 0 when none.
    static EMITTING: Cell<usize> = const { Cell::new(0) };
}

/// Serialises emissions against cancellation: once `close` returns, no
/// callback starts again. `close` called from inside a callback does not
/// wait on itself.
struct EmitGate {
    lock: Mutex<()>,
    cancel: CancellationToken,
}

impl EmitGate {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn emit(self: &Arc<Self>, deliver: impl FnOnce()) -> bool {
        let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return false;
        }
        let outer = EMITTING.with(|e| e.replace(self.id()));
        deliver();
        EMITTING.with(|e| e.set(outer));
        true
    }

    fn close(self: &Arc<Self>) {
        self.cancel.cancel();
        if EMITTING.with(|e| e.get()) != self.id() {
            drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

/// Handle to a running subscription. Dropping it cancels the subscription.
pub struct SubscriptionHandle {
    commands: mpsc::UnboundedSender<Command>,
    gate: Arc<EmitGate>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl SubscriptionHandle {
    /// Stop the subscription. No update or error is delivered after this
    /// returns, including the result of a recompute already under way.
    pub fn cancel(&self) {
        self.gate.close();
        self.state.send_replace(SubscriptionState::Cancelled);
    }

    /// Switch to another day: a fresh dedup cache and a full pass.
    pub fn change_target_date(&self, target: MonthDay) -> Result<(), SubscriptionError> {
        if self.gate.cancel.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        self.commands
            .send(Command::ChangeTarget(target))
            .map_err(|_| SubscriptionError::Closed)
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.cancel.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Start a subscription on the current tokio runtime.
pub fn spawn_subscription(
    aggregator: FanoutAggregator,
    settings: SubscriptionSettings,
    target: MonthDay,
    on_update: UpdateFn,
    on_error: ErrorFn,
) -> SubscriptionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let gate = Arc::new(EmitGate {
        lock: Mutex::new(()),
        cancel: CancellationToken::new(),
    });
    let (state, _) = watch::channel(SubscriptionState::Idle);
    let state = Arc::new(state);

    let worker = Worker {
        aggregator,
        settings,
        target,
        commands: rx,
        gate: Arc::clone(&gate),
        state: Arc::clone(&state),
        on_update,
        on_error,
        revision: 0,
        consecutive_failures: 0,
    };
    tokio::spawn(worker.run());

    SubscriptionHandle {
        commands: tx,
        gate,
        state,
    }
}

struct Worker {
    aggregator: FanoutAggregator,
    settings: SubscriptionSettings,
    target: MonthDay,
    commands: mpsc::UnboundedReceiver<Command>,
    gate: Arc<EmitGate>,
    state: Arc<watch::Sender<SubscriptionState>>,
    on_update: UpdateFn,
    on_error: ErrorFn,
    revision: u64,
    consecutive_failures: u32,
}

impl Worker {
    async fn run(mut self) {
        info!("Subscription started for {}", self.target);
        loop {
            let reason = match self.session().await {
                Flow::Cancelled => break,
                Flow::Retarget(target) => {
                    info!("Subscription retargeted {} → {}", self.target, target);
                    self.target = target;
                    self.consecutive_failures = 0;
                    continue;
                }
                Flow::Failed(reason) => reason,
            };

            self.consecutive_failures += 1;
            self.set_state(SubscriptionState::Failed);
            let attempt = self.consecutive_failures;
            if attempt > self.settings.max_retries {
                warn!(
                    "Subscription for {} giving up after {} attempts: {}",
                    self.target, attempt, reason
                );
                let on_error = Arc::clone(&self.on_error);
                self.gate.emit(|| {
                    on_error(SubscriptionError::RetriesExhausted {
                        attempts: attempt,
                        reason,
                    })
                });
                return;
            }

            let delay = backoff_delay(&self.settings, attempt);
            warn!(
                "Subscription for {} failed (attempt {}), retrying in {:?}: {}",
                self.target, attempt, delay, reason
            );
            let on_error = Arc::clone(&self.on_error);
            self.gate.emit(|| {
                on_error(SubscriptionError::Transient {
                    attempt,
                    retry_in: delay,
                    reason,
                })
            });

            let slept = interruptible(
                &self.gate.cancel,
                &mut self.commands,
                tokio::time::sleep(delay),
            )
            .await;
            match slept {
                Ok(()) => {}
                Err(Flow::Retarget(target)) => {
                    self.target = target;
                    self.consecutive_failures = 0;
                }
                Err(_) => break,
            }
        }
        self.set_state(SubscriptionState::Cancelled);
        info!("Subscription for {} cancelled", self.target);
    }

    /// Subscribe, emit the initial view, then follow changes until
    /// something ends the session.
    async fn session(&mut self) -> Flow {
        match self.follow().await {
            Ok(never) => match never {},
            Err(flow) => flow,
        }
    }

    async fn follow(&mut self) -> Result<Infallible, Flow> {
        self.set_state(SubscriptionState::Subscribing);
        let mut dedup = DedupCache::new(self.settings.dedup_capacity);
        let mut watches: SelectAll<ChangeStream> = SelectAll::new();
        let mut watched: HashSet<FixtureKey> = HashSet::new();

        let first = step(
            interruptible(
                &self.gate.cancel,
                &mut self.commands,
                self.aggregator.aggregate(self.target),
            )
            .await,
        )?;
        let mut current = self.settle(first, &mut watches, &mut watched).await?;

        if !self.emit(&current) {
            return Err(Flow::Cancelled);
        }
        self.set_state(SubscriptionState::Active);
        self.consecutive_failures = 0;

        loop {
            let batch = self.next_batch(&mut watches).await?;
            let received = batch.len();
            let novel = dedup.admit_batch(batch);
            if novel.is_empty() {
                debug!("Batch of {} duplicate event(s) for {} ignored", received, self.target);
                continue;
            }

            self.set_state(SubscriptionState::Recomputing);
            let affected: Vec<FixtureKey> = novel.iter().map(|e| e.fixture.clone()).collect();
            debug!(
                "Recomputing {} for {} novel of {} event(s)",
                self.target,
                novel.len(),
                received
            );
            let next = step(
                interruptible(
                    &self.gate.cancel,
                    &mut self.commands,
                    self.aggregator.refresh(&current, &affected),
                )
                .await,
            )?;
            current = self.settle(next, &mut watches, &mut watched).await?;

            if !self.emit(&current) {
                return Err(Flow::Cancelled);
            }
            self.set_state(SubscriptionState::Active);
        }
    }

    /// Open watches for every fixture of `aggregation` not watched yet, then
    /// re-read the competitions of those fixtures. A change stored before
    /// its watch was live is picked up by the re-read; anything later
    /// arrives on the watch. Existing watches are kept, so nothing already
    /// buffered on them is lost. Repeats until no new fixture shows up.
    async fn settle(
        &mut self,
        mut aggregation: Aggregation,
        watches: &mut SelectAll<ChangeStream>,
        watched: &mut HashSet<FixtureKey>,
    ) -> Result<Aggregation, Flow> {
        loop {
            let added: Vec<FixtureKey> = aggregation
                .fixture_keys()
                .into_iter()
                .filter(|k| !watched.contains(k))
                .collect();
            if added.is_empty() {
                return Ok(aggregation);
            }

            let opened = step(
                interruptible(
                    &self.gate.cancel,
                    &mut self.commands,
                    open_watches(self.aggregator.repository(), &added),
                )
                .await,
            )?;
            watches.extend(opened);
            watched.extend(added.iter().cloned());

            let reread = step(
                interruptible(
                    &self.gate.cancel,
                    &mut self.commands,
                    self.aggregator.refresh(&aggregation, &added),
                )
                .await,
            )?;
            aggregation = reread;
        }
    }

    /// Wait for the first event of a burst, then keep collecting until the
    /// debounce window closes.
    async fn next_batch(
        &mut self,
        watches: &mut SelectAll<ChangeStream>,
    ) -> Result<Vec<ChangeEvent>, Flow> {
        let first = tokio::select! {
            biased;
            _ = self.gate.cancel.cancelled() => return Err(Flow::Cancelled),
            cmd = self.commands.recv() => return Err(command_flow(cmd)),
            item = watches.next(), if !watches.is_empty() => item,
        };
        let mut batch = vec![watch_item(first)?];

        let deadline = Instant::now() + self.settings.debounce;
        loop {
            tokio::select! {
                biased;
                _ = self.gate.cancel.cancelled() => return Err(Flow::Cancelled),
                cmd = self.commands.recv() => return Err(command_flow(cmd)),
                _ = tokio::time::sleep_until(deadline) => break,
                item = watches.next() => batch.push(watch_item(item)?),
            }
        }
        Ok(batch)
    }

    fn emit(&mut self, aggregation: &Aggregation) -> bool {
        let update = ViewUpdate {
            target: aggregation.target,
            revision: self.revision + 1,
            view: organize(&aggregation.matches),
            partial_failure: aggregation.partial_failure(),
        };
        let on_update = Arc::clone(&self.on_update);
        let delivered = self.gate.emit(|| on_update(update));
        if delivered {
            self.revision += 1;
            debug!("Emitted revision {} for {}", self.revision, aggregation.target);
        }
        delivered
    }

    fn set_state(&self, next: SubscriptionState) {
        self.state.send_if_modified(|current| {
            if *current == SubscriptionState::Cancelled || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Drive `fut` unless the subscription is cancelled or retargeted first,
/// in which case `fut` is dropped unfinished.
async fn interruptible<T>(
    cancel: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    fut: impl Future<Output = T>,
) -> Result<T, Flow> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Flow::Cancelled),
        cmd = commands.recv() => Err(command_flow(cmd)),
        out = fut => Ok(out),
    }
}

fn command_flow(cmd: Option<Command>) -> Flow {
    match cmd {
        Some(Command::ChangeTarget(target)) => Flow::Retarget(target),
        None => Flow::Cancelled,
    }
}

/// Flatten an interruptible repository step into the session flow.
fn step<T, E: std::fmt::Display>(out: Result<Result<T, E>, Flow>) -> Result<T, Flow> {
    match out {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Flow::Failed(e.to_string())),
        Err(flow) => Err(flow),
    }
}

fn watch_item(
    item: Option<Result<ChangeEvent, RepositoryError>>,
) -> Result<ChangeEvent, Flow> {
    match item {
        Some(Ok(event)) => Ok(event),
        Some(Err(e)) => Err(Flow::Failed(format!("watch failed: {}", e))),
        None => Err(Flow::Failed("all watches closed".into())),
    }
}

/// One stream per fixture watch, each ending in an error so that a single
/// watch closing is surfaced rather than silently dropped from the merge.
async fn open_watches(
    repo: &Arc<dyn Repository>,
    keys: &[FixtureKey],
) -> Result<Vec<ChangeStream>, RepositoryError> {
    let streams =
        futures_util::future::try_join_all(keys.iter().map(|k| repo.watch_scores(k))).await?;
    let guarded = keys
        .iter()
        .zip(streams)
        .map(|(key, s)| {
            let closed = RepositoryError::unavailable(format!("watch on {} closed", key));
            s.chain(stream::once(async move { Err(closed) })).boxed()
        })
        .collect();
    debug!("Watching {} more fixture(s) on {}", keys.len(), repo.name());
    Ok(guarded)
}

/// Exponential backoff from `retry_base`, capped at `retry_max`, with up to
/// half a base interval of jitter.
fn backoff_delay(settings: &SubscriptionSettings, attempt: u32) -> Duration {
    let exp = settings
        .retry_base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(settings.retry_max);
    let jitter_ms = (settings.retry_base.as_millis() / 2) as u64;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    capped + jitter
}
