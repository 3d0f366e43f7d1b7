use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use plait_core::config::StoreConfig;
use plait_core::error::{PlaitError, Result};
use plait_core::event::{EventKind, WorkflowEvent};
use plait_core::types::RunId;

/// What a run's result resolves to.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutput {
    pub final_outputs: Map<String, Value>,
    pub step_responses: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Cancelled,
}

/// Immutable copy of a run's state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub id: RunId,
    pub workflow_id: String,
    pub task: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<WorkflowEvent>,
    pub step_outputs: Map<String, Value>,
    pub step_responses: IndexMap<String, String>,
    pub output: Option<RunOutput>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Finished(RunOutput),
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn into_result(self) -> Result<RunOutput> {
        match self {
            Outcome::Finished(output) => Ok(output),
            Outcome::Failed(message) => Err(PlaitError::RunFailed(message)),
            Outcome::Cancelled => Err(PlaitError::Cancelled),
        }
    }
}

/// Awaitable result of a run. Clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct RunResult {
    id: RunId,
    rx: watch::Receiver<Option<Outcome>>,
}

impl RunResult {
    pub async fn wait(mut self) -> Result<RunOutput> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            // Run removed before it settled.
            Err(_) => return Err(PlaitError::RunNotFound(self.id.to_string())),
        };
        match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(PlaitError::RunNotFound(self.id.to_string())),
        }
    }
}

/// Returned by [`RunStore::create`].
pub struct RunTicket {
    pub id: RunId,
    pub signal: CancellationToken,
    pub result: RunResult,
}

struct RunState {
    status: RunStatus,
    events: Vec<WorkflowEvent>,
    closed: bool,
    finished_at: Option<DateTime<Utc>>,
    step_outputs: Map<String, Value>,
    step_responses: IndexMap<String, String>,
    output: Option<RunOutput>,
    error: Option<String>,
}

struct RunEntry {
    id: RunId,
    seq: u64,
    workflow_id: String,
    task: String,
    created_at: DateTime<Utc>,
    signal: CancellationToken,
    state: Mutex<RunState>,
    tick: watch::Sender<u64>,
    outcome: watch::Sender<Option<Outcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunEntry {
    fn notify(&self) {
        self.tick.send_modify(|n| *n += 1);
    }

    /// Settle the result unless it has already settled.
    fn settle(&self, outcome: Outcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    fn close(&self, state: &mut RunState) {
        if !state.closed {
            state.closed = true;
            state.finished_at.get_or_insert_with(Utc::now);
        }
    }
}

/// Holds every live and recently finished run.
///
/// Subscribers replay a run's log from the start and then tail it. Finished
/// runs stay readable for a grace period, capped at `max_finished_runs`.
pub struct RunStore {
    runs: Mutex<HashMap<RunId, Arc<RunEntry>>>,
    next_seq: AtomicU64,
    retention: StoreConfig,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl RunStore {
    pub fn new(retention: StoreConfig) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            retention,
        }
    }

    fn get(&self, id: &RunId) -> Result<Arc<RunEntry>> {
        lock(&self.runs)
            .get(id)
            .cloned()
            .ok_or_else(|| PlaitError::RunNotFound(id.to_string()))
    }

    /// Register a new running run.
    pub fn create(&self, workflow_id: &str, task: &str) -> RunTicket {
        self.sweep();

        let id = RunId::new();
        let signal = CancellationToken::new();
        let (tick, _) = watch::channel(0);
        let (outcome, outcome_rx) = watch::channel(None);
        let entry = Arc::new(RunEntry {
            id: id.clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            workflow_id: workflow_id.to_string(),
            task: task.to_string(),
            created_at: Utc::now(),
            signal: signal.clone(),
            state: Mutex::new(RunState {
                status: RunStatus::Running,
                events: Vec::new(),
                closed: false,
                finished_at: None,
                step_outputs: Map::new(),
                step_responses: IndexMap::new(),
                output: None,
                error: None,
            }),
            tick,
            outcome,
        });
        lock(&self.runs).insert(id.clone(), entry);
        debug!(run_id = %id, workflow_id, "Run created");

        RunTicket {
            result: RunResult {
                id: id.clone(),
                rx: outcome_rx,
            },
            id,
            signal,
        }
    }

    /// Append an event. A no-op once the run's queue is closed.
    pub fn push(&self, id: &RunId, kind: EventKind) -> Result<()> {
        let entry = self.get(id)?;
        {
            let mut state = lock(&entry.state);
            if state.closed {
                debug!(run_id = %id, event = kind.name(), "Dropping event for closed run");
                return Ok(());
            }
            state.events.push(WorkflowEvent::new(id.clone(), kind));
        }
        entry.notify();
        Ok(())
    }

    /// Merge a finished step's captured outputs and keep its response.
    pub fn record_step(
        &self,
        id: &RunId,
        step_id: &str,
        response: &str,
        captured: &Map<String, Value>,
    ) -> Result<()> {
        let entry = self.get(id)?;
        let mut state = lock(&entry.state);
        state
            .step_outputs
            .extend(captured.iter().map(|(k, v)| (k.clone(), v.clone())));
        state
            .step_responses
            .insert(step_id.to_string(), response.to_string());
        Ok(())
    }

    /// Replay the run's events from the start, then follow new ones until
    /// the queue closes.
    pub fn events(&self, id: &RunId) -> Result<BoxStream<'static, WorkflowEvent>> {
        let entry = self.get(id)?;
        let rx = entry.tick.subscribe();

        enum Next {
            Event(WorkflowEvent),
            Done,
            Wait,
        }

        let stream = stream::unfold((entry, rx, 0usize), |(entry, mut rx, idx)| async move {
            loop {
                // Mark the current tick seen before looking at the log.
                drop(rx.borrow_and_update());
                let next = {
                    let state = lock(&entry.state);
                    match state.events.get(idx) {
                        Some(event) => Next::Event(event.clone()),
                        None if state.closed => Next::Done,
                        None => Next::Wait,
                    }
                };
                match next {
                    Next::Event(event) => return Some((event, (entry, rx, idx + 1))),
                    Next::Done => return None,
                    Next::Wait => {
                        if rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    /// Push the terminal event, resolve the result and close the queue in
    /// one step. Returns `false` and leaves the run untouched when it is no
    /// longer running, so a cancellation that got there first wins.
    fn conclude(&self, id: &RunId, kind: EventKind, outcome: Outcome) -> Result<bool> {
        let entry = self.get(id)?;
        {
            let mut state = lock(&entry.state);
            if state.status != RunStatus::Running {
                return Ok(false);
            }
            match &outcome {
                Outcome::Finished(output) => {
                    state.status = RunStatus::Finished;
                    state.output = Some(output.clone());
                }
                Outcome::Failed(message) => {
                    state.status = RunStatus::Failed;
                    state.error = Some(message.clone());
                }
                Outcome::Cancelled => {
                    state.status = RunStatus::Cancelled;
                    state.error = Some(PlaitError::Cancelled.to_string());
                }
            }
            if !state.closed {
                state.events.push(WorkflowEvent::new(id.clone(), kind));
            }
            entry.close(&mut state);
        }
        entry.settle(outcome);
        entry.notify();
        Ok(true)
    }

    /// Record `run_finished`, resolve the result and close the queue.
    pub fn finalize(&self, id: &RunId, output: RunOutput) -> Result<bool> {
        let kind = EventKind::RunFinished {
            output: output.final_outputs.clone(),
        };
        let done = self.conclude(id, kind, Outcome::Finished(output))?;
        if done {
            info!(run_id = %id, "Run finished");
        }
        Ok(done)
    }

    /// Record `run_error`, reject the result and close the queue.
    pub fn fail(
        &self,
        id: &RunId,
        step_id: Option<String>,
        message: impl Into<String>,
    ) -> Result<bool> {
        let message = message.into();
        let kind = EventKind::RunError {
            step_id,
            error: message.clone(),
        };
        let done = self.conclude(id, kind, Outcome::Failed(message.clone()))?;
        if done {
            info!(run_id = %id, error = %message, "Run failed");
        }
        Ok(done)
    }

    /// Abort the run's signal and reject its result with `Cancelled`.
    ///
    /// Idempotent, and also settles a run whose signal was tripped directly.
    /// The queue stays open so the runner can still push its terminal event
    /// before calling [`RunStore::close`].
    pub fn cancel(&self, id: &RunId) -> Result<()> {
        let entry = self.get(id)?;
        entry.signal.cancel();
        {
            let mut state = lock(&entry.state);
            if state.status != RunStatus::Running {
                return Ok(());
            }
            state.status = RunStatus::Cancelled;
            state.error = Some(PlaitError::Cancelled.to_string());
        }
        entry.settle(Outcome::Cancelled);
        info!(run_id = %id, "Run cancelled");
        Ok(())
    }

    /// Close the event queue without touching the result.
    pub fn close(&self, id: &RunId) -> Result<()> {
        let entry = self.get(id)?;
        {
            let mut state = lock(&entry.state);
            entry.close(&mut state);
        }
        entry.notify();
        Ok(())
    }

    pub fn result(&self, id: &RunId) -> Result<RunResult> {
        let entry = self.get(id)?;
        Ok(RunResult {
            id: id.clone(),
            rx: entry.outcome.subscribe(),
        })
    }

    pub fn snapshot(&self, id: &RunId) -> Result<RunSnapshot> {
        let entry = self.get(id)?;
        let state = lock(&entry.state);
        Ok(RunSnapshot {
            id: entry.id.clone(),
            workflow_id: entry.workflow_id.clone(),
            task: entry.task.clone(),
            status: state.status,
            created_at: entry.created_at,
            finished_at: state.finished_at,
            events: state.events.clone(),
            step_outputs: state.step_outputs.clone(),
            step_responses: state.step_responses.clone(),
            output: state.output.clone(),
            error: state.error.clone(),
        })
    }

    /// Remove a run. Live subscribers see the stream end.
    pub fn delete(&self, id: &RunId) -> bool {
        let Some(entry) = lock(&self.runs).remove(id) else {
            return false;
        };
        {
            let mut state = lock(&entry.state);
            entry.close(&mut state);
        }
        entry.notify();
        debug!(run_id = %id, "Run deleted");
        true
    }

    pub fn contains(&self, id: &RunId) -> bool {
        lock(&self.runs).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict finished runs past the grace period, then the oldest finished
    /// runs beyond capacity. Running runs are never evicted.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        // chrono durations are bounded by i64 milliseconds
        let grace_secs = self.retention.finished_grace_secs.min(i64::MAX as u64 / 1_000);
        let grace = Duration::seconds(grace_secs as i64);
        let mut runs = lock(&self.runs);

        let mut finished: Vec<(RunId, DateTime<Utc>, u64)> = runs
            .iter()
            .filter_map(|(id, entry)| {
                let state = lock(&entry.state);
                match (state.closed, state.finished_at) {
                    (true, Some(at)) => Some((id.clone(), at, entry.seq)),
                    _ => None,
                }
            })
            .collect();
        finished.sort_by_key(|(_, at, seq)| (*at, *seq));

        let expired = finished
            .iter()
            .take_while(|(_, at, _)| now.signed_duration_since(*at) >= grace)
            .count();
        let over_capacity = (finished.len() - expired).saturating_sub(self.retention.max_finished_runs);
        let evict = expired + over_capacity;

        for (id, _, _) in finished.iter().take(evict) {
            runs.remove(id);
        }
        if evict > 0 {
            debug!(evicted = evict, remaining = runs.len(), "Swept finished runs");
        }
        evict
    }
}
