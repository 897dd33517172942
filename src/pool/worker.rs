//! Pool worker and opener workers.
//!
//! The pool worker is the single owner of `PoolState`: control requests,
//! resource pushes, open completions and timers are all processed here, one
//! at a time. Resource opens run on a separate pool of opener threads and
//! report back through the event channel, so a slow open never stalls the
//! pool.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ExecutionError, QuoteError, QuoteResult};
use crate::key::Key;
use crate::resource::{PushSink, ResourceError, ResourceOpener};

use super::state::{Effect, PoolState};
use super::listener::{Listener, ListenerId};
use super::stats::PoolStats;

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Subscribe {
        key: Key,
        listener: Listener,
        replay: bool,
    },
    Unsubscribe {
        key: Key,
        listener: ListenerId,
    },
    Prefetch {
        key: Key,
    },
    Redeliver {
        key: Key,
        listener: ListenerId,
        delay: Duration,
    },
    Stats {
        reply: Sender<PoolStats>,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum EventMsg {
    Push {
        key: Key,
        value: String,
        observed_at: DateTime<Utc>,
    },
    OpenCompleted {
        key: Key,
        result: Result<(), ResourceError>,
    },
}

struct OpenJob {
    key: Key,
}

/// Threads that run `ResourceOpener::open`.
pub(crate) struct OpenerPool {
    tx: Sender<OpenJob>,
    workers: Vec<JoinHandle<()>>,
}

impl OpenerPool {
    pub fn start(
        workers: usize,
        opener: Arc<dyn ResourceOpener>,
        events_tx: Sender<EventMsg>,
        dropped_pushes: Arc<AtomicU64>,
    ) -> QuoteResult<Self> {
        let workers = workers.max(1);
        // In-flight opens never exceed the worker count, so the job queue never fills.
        let (tx, rx) = bounded::<OpenJob>(workers);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<OpenJob> = rx.clone();
            let opener = Arc::clone(&opener);
            let events_tx = events_tx.clone();
            let dropped_pushes = Arc::clone(&dropped_pushes);
            let name = format!("quotepool-open-{idx}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(OpenJob { key }) = rx.recv() {
                        let sink = PushSink::new(key.clone(), events_tx.clone(), Arc::clone(&dropped_pushes));
                        let result = catch_unwind(AssertUnwindSafe(|| opener.open(&key, sink)))
                            .unwrap_or_else(|payload| Err(ResourceError::Panicked(panic_message(payload.as_ref()))));
                        if events_tx.send(EventMsg::OpenCompleted { key, result }).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| {
                    QuoteError::Execution(ExecutionError::WorkerSpawn {
                        name,
                        message: e.to_string(),
                    })
                })?;
            handles.push(handle);
        }

        Ok(Self { tx, workers: handles })
    }

    fn try_submit(&self, key: Key) -> Result<(), ResourceError> {
        match self.tx.try_send(OpenJob { key }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ResourceError::Unavailable("opener queue full".to_string())),
            Err(TrySendError::Disconnected(_)) => Err(ResourceError::Unavailable("opener workers stopped".to_string())),
        }
    }

    fn shutdown(self) {
        // Opens may block for a long time; workers exit once their current job
        // completes and they observe the closed queue. Do not join.
        drop(self.tx);
        drop(self.workers);
    }
}

pub(crate) struct WorkerContext {
    pub cfg: PoolConfig,
    pub state: PoolState,
    pub opener: Arc<dyn ResourceOpener>,
    pub openers: OpenerPool,
    pub dropped_pushes: Arc<AtomicU64>,
    /// Keeps the event channel connected for as long as the worker runs.
    pub events_tx: Sender<EventMsg>,
}

pub(crate) fn worker_loop(ctx: WorkerContext, control_rx: Receiver<ControlMsg>, events_rx: Receiver<EventMsg>) {
    let WorkerContext {
        cfg,
        mut state,
        opener,
        openers,
        dropped_pushes,
        events_tx,
    } = ctx;

    info!(
        open_concurrency = cfg.open_concurrency,
        max_open_resources = cfg.max_open_resources,
        "pool worker started"
    );

    loop {
        let now = Instant::now();
        let wait = state
            .next_deadline()
            .map_or(cfg.maintenance_interval, |deadline| {
                deadline.saturating_duration_since(now).min(cfg.maintenance_interval)
            });

        let mut stop = false;
        select! {
            recv(control_rx) -> msg => {
                match msg {
                    Ok(ControlMsg::Shutdown) | Err(_) => stop = true,
                    Ok(msg) => handle_control(&mut state, msg, &dropped_pushes),
                }
            }
            recv(events_rx) -> msg => {
                match msg {
                    Ok(EventMsg::Push { key, value, observed_at }) => state.on_push(key, value, observed_at),
                    Ok(EventMsg::OpenCompleted { key, result }) => state.on_open_completed(key, result, Instant::now()),
                    Err(_) => {}
                }
            }
            default(wait) => {}
        }

        if stop {
            break;
        }

        let now = Instant::now();
        state.fire_due_timers(now);
        state.drain(now);
        run_effects(&mut state, opener.as_ref(), &openers);
    }

    state.shutdown();
    run_effects(&mut state, opener.as_ref(), &openers);
    openers.shutdown();
    drop(events_tx);
    info!("pool worker stopped");
}

fn handle_control(state: &mut PoolState, msg: ControlMsg, dropped_pushes: &AtomicU64) {
    let now = Instant::now();
    match msg {
        ControlMsg::Subscribe { key, listener, replay } => state.subscribe(key, listener, replay, now),
        ControlMsg::Unsubscribe { key, listener } => state.unsubscribe(&key, listener, now),
        ControlMsg::Prefetch { key } => state.prefetch(key, now),
        ControlMsg::Redeliver { key, listener, delay } => match now.checked_add(delay) {
            Some(deadline) => state.redeliver_after(key, listener, deadline),
            None => warn!(key = %key, ?delay, "redelivery delay out of range; dropped"),
        },
        ControlMsg::Stats { reply } => {
            let _ = reply.send(state.stats(dropped_pushes.load(Ordering::Relaxed)));
        }
        ControlMsg::Shutdown => {}
    }
}

fn run_effects(state: &mut PoolState, opener: &dyn ResourceOpener, openers: &OpenerPool) {
    // A failed submit feeds back into the state and may queue a retry, which
    // the next drain pass picks up.
    for effect in state.take_effects() {
        match effect {
            Effect::Open { key } => {
                debug!(key = %key, "submitting open");
                if let Err(err) = openers.try_submit(key.clone()) {
                    state.on_open_completed(key, Err(err), Instant::now());
                }
            }
            Effect::Close { key } => {
                debug!(key = %key, "closing resource");
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| opener.close(&key))) {
                    warn!(key = %key, panic = %panic_message(payload.as_ref()), "resource close panicked");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
