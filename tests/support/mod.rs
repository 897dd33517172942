#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};

use quotepool::{Key, KeyedResourcePool, Listener, PoolConfig, PushSink, ResourceError, ResourceOpener};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(s: &str) -> Key {
    Key::parse(s).unwrap()
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenerEvent {
    Opened(Key),
    Failed(Key),
    Closed(Key),
}

/// A resource opener driven by the test: records every open and close, keeps
/// the push sink of each open resource, and can be told to fail keys.
pub struct ScriptedOpener {
    sinks: Mutex<HashMap<Key, PushSink>>,
    failing: Mutex<HashSet<Key>>,
    log: Mutex<Vec<OpenerEvent>>,
    open_delay: Duration,
}

impl ScriptedOpener {
    pub fn new() -> Arc<Self> {
        Self::with_open_delay(Duration::ZERO)
    }

    pub fn with_open_delay(open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sinks: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
            open_delay,
        })
    }

    pub fn fail(&self, key: &Key) {
        self.failing.lock().unwrap().insert(key.clone());
    }

    /// Pushes `value` through the sink of an open resource.
    pub fn push(&self, key: &Key, value: &str) {
        let sink = self
            .sinks
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| panic!("no open resource for {key}"));
        sink.push_now(value).unwrap();
    }

    pub fn sink(&self, key: &Key) -> Option<PushSink> {
        self.sinks.lock().unwrap().get(key).cloned()
    }

    pub fn opens_of(&self, key: &Key) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, OpenerEvent::Opened(k) | OpenerEvent::Failed(k) if k == key))
            .count()
    }

    pub fn closes_of(&self, key: &Key) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, OpenerEvent::Closed(k) if k == key))
            .count()
    }

    pub fn log(&self) -> Vec<OpenerEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Waits until `expected` has been recorded, in any order relative to
    /// other events.
    pub fn expect(&self, expected: &OpenerEvent) {
        if !wait_until(WAIT, || self.log.lock().unwrap().contains(expected)) {
            panic!("timed out waiting for {expected:?}; log: {:?}", self.log());
        }
    }

    fn record(&self, event: OpenerEvent) {
        self.log.lock().unwrap().push(event);
    }
}

impl ResourceOpener for ScriptedOpener {
    fn open(&self, key: &Key, sink: PushSink) -> Result<(), ResourceError> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        if self.failing.lock().unwrap().contains(key) {
            self.record(OpenerEvent::Failed(key.clone()));
            return Err(ResourceError::OpenFailed(format!("scripted failure for {key}")));
        }
        self.sinks.lock().unwrap().insert(key.clone(), sink);
        self.record(OpenerEvent::Opened(key.clone()));
        Ok(())
    }

    fn close(&self, key: &Key) {
        self.sinks.lock().unwrap().remove(key);
        self.record(OpenerEvent::Closed(key.clone()));
    }
}

pub fn pool(cfg: PoolConfig, opener: &Arc<ScriptedOpener>) -> Arc<KeyedResourcePool> {
    let opener: Arc<dyn ResourceOpener> = opener.clone();
    Arc::new(KeyedResourcePool::new(cfg, opener).unwrap())
}

pub fn config(open_concurrency: usize, max_open_resources: usize, idle_window: Duration) -> PoolConfig {
    PoolConfig {
        open_concurrency,
        max_open_resources,
        idle_window,
        maintenance_interval: Duration::from_millis(10),
        ..PoolConfig::default()
    }
}

/// A listener that forwards `(key, value)` into a channel.
pub fn channel_listener() -> (Listener, Receiver<(String, String)>) {
    let (tx, rx) = unbounded();
    let listener = Listener::new(move |key, value, _| {
        let _ = tx.send((key.to_string(), value.to_string()));
    });
    (listener, rx)
}
