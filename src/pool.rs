//! The pool of locally spawned inference processes.
//!
//! Each backend serves exactly one model and is keyed by the model name it
//! was requested under. Memory is the scarce resource: before a backend is
//! spawned, enough memory has to be available for its weights, and the least
//! recently used backends are killed until it is. The memory a backend uses
//! is estimated once, at spawn time, from the size of its weights file.
//!
//! The whole check, evict, spawn and register sequence runs under a single
//! lock so that two admissions never count the same free memory twice.

pub(crate) mod memory;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use memory::MemoryProbe;

#[derive(Error, Debug)]
pub(crate) enum PoolError {
    #[error("not enough memory: {required} bytes required, at most {obtainable} obtainable")]
    InsufficientMemory { required: u64, obtainable: u64 },
    #[error("no ports left to allocate")]
    PortsExhausted,
    #[error("failed to spawn \"{binary}\": {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
}

/// How to start a backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LaunchSpec {
    pub binary_path: String,
    pub args: Vec<String>,
    pub weights_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct BackendStatus {
    pub model: String,
    pub port: u16,
    pub memory_bytes: u64,
    pub idle_secs: u64,
}

struct RunningBackend {
    child: Child,
    last_used: Instant,
    memory_bytes: u64,
    port: u16,
}

impl RunningBackend {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

struct PoolState {
    backends: HashMap<String, RunningBackend>,
    next_port: Option<u16>,
}

impl PoolState {
    fn reserved(&self) -> u64 {
        self.backends
            .values()
            .fold(0u64, |acc, b| acc.saturating_add(b.memory_bytes))
    }
}

pub(crate) struct ProcessPool {
    state: Mutex<PoolState>,
    probe: Box<dyn MemoryProbe>,
    memory_budget: Option<u64>,
    warned_unconstrained: AtomicBool,
}

impl ProcessPool {
    pub(crate) fn new(
        base_port: u16,
        memory_budget: Option<u64>,
        probe: Box<dyn MemoryProbe>,
    ) -> ProcessPool {
        ProcessPool {
            state: Mutex::new(PoolState {
                backends: HashMap::new(),
                next_port: Some(base_port),
            }),
            probe,
            memory_budget,
            warned_unconstrained: AtomicBool::new(false),
        }
    }

    /// Memory that could be handed to a new backend right now.
    fn available(&self, state: &PoolState) -> Option<u64> {
        let probed = self.probe.available_bytes();
        let budgeted = self
            .memory_budget
            .map(|budget| budget.saturating_sub(state.reserved()));

        match (probed, budgeted) {
            (Some(probed), Some(budgeted)) => Some(probed.min(budgeted)),
            (probed, budgeted) => probed.or(budgeted),
        }
    }

    fn warn_unconstrained(&self) {
        if !self.warned_unconstrained.swap(true, Ordering::Relaxed) {
            warn!("available memory is unknown and no memory budget is set, admitting backends unconditionally");
        }
    }

    /// Whether `required` bytes could be obtained by evicting every backend.
    pub(crate) async fn can_admit(&self, required: u64) -> bool {
        let state = self.state.lock().await;

        match self.available(&state) {
            Some(available) => available.saturating_add(state.reserved()) >= required,
            None => true,
        }
    }

    /// Refreshes the last use of a backend, returning its port.
    pub(crate) async fn touch(&self, model: &str) -> Option<u16> {
        let mut state = self.state.lock().await;

        let backend = state.backends.get_mut(model)?;
        backend.last_used = Instant::now();

        Some(backend.port)
    }

    /// Kills the least recently used backend. Returns false if the pool is
    /// empty.
    pub(crate) async fn evict_one_lru(&self) -> bool {
        let mut state = self.state.lock().await;

        Self::evict_lru_locked(&mut state).await.is_some()
    }

    async fn evict_lru_locked(state: &mut PoolState) -> Option<u64> {
        let model = state
            .backends
            .iter()
            .min_by_key(|(_, backend)| backend.last_used)
            .map(|(model, _)| model.clone())?;

        let mut backend = state.backends.remove(&model)?;

        info!(
            model = %model,
            port = backend.port,
            memory_bytes = backend.memory_bytes,
            "evicting backend"
        );

        Self::kill(&model, &mut backend.child).await;

        Some(backend.memory_bytes)
    }

    async fn kill(model: &str, child: &mut Child) {
        // Killing a process that already exited is fine
        if let Err(err) = child.kill().await {
            debug!(model = %model, error = %err, "backend was not running");
        }
    }

    /// Evicts backends until `required` bytes are available.
    async fn admit_locked(&self, state: &mut PoolState, required: u64) -> Result<(), PoolError> {
        let initial = match self.available(state) {
            Some(available) => available,
            None => {
                self.warn_unconstrained();
                return Ok(());
            }
        };

        let obtainable = initial.saturating_add(state.reserved());

        if obtainable < required {
            return Err(PoolError::InsufficientMemory {
                required,
                obtainable,
            });
        }

        let mut freed = 0u64;

        loop {
            // The probe can lag behind a kill; trust the bookkeeping until
            // it catches up
            let effective = self
                .available(state)
                .unwrap_or(0)
                .max(initial.saturating_add(freed));

            if effective >= required {
                return Ok(());
            }

            match Self::evict_lru_locked(state).await {
                Some(memory_bytes) => freed = freed.saturating_add(memory_bytes),
                None => {
                    return Err(PoolError::InsufficientMemory {
                        required,
                        obtainable: effective,
                    })
                }
            }
        }
    }

    fn allocate_port(state: &mut PoolState) -> Result<u16, PoolError> {
        let port = state.next_port.ok_or(PoolError::PortsExhausted)?;

        state.next_port = port.checked_add(1);

        Ok(port)
    }

    fn spawn(launch: &LaunchSpec, port: u16) -> Result<Child, PoolError> {
        Command::new(&launch.binary_path)
            .args(&launch.args)
            .arg("--port")
            .arg(port.to_string())
            .arg("--model")
            .arg(&launch.weights_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                binary: launch.binary_path.clone(),
                source,
            })
    }

    /// Returns the port of the backend serving `model`, starting one if
    /// needed.
    pub(crate) async fn provision(
        &self,
        model: &str,
        launch: &LaunchSpec,
        memory_bytes: u64,
    ) -> Result<u16, PoolError> {
        let mut state = self.state.lock().await;

        if let Some(backend) = state.backends.get_mut(model) {
            if !backend.has_exited() {
                backend.last_used = Instant::now();
                return Ok(backend.port);
            }

            warn!(model = %model, port = backend.port, "backend exited, restarting it");
            state.backends.remove(model);
        }

        self.admit_locked(&mut state, memory_bytes).await?;

        let port = Self::allocate_port(&mut state)?;
        let child = Self::spawn(launch, port)?;

        info!(
            model = %model,
            port,
            memory_bytes,
            pid = child.id(),
            "spawned backend"
        );

        state.backends.insert(
            model.to_string(),
            RunningBackend {
                child,
                last_used: Instant::now(),
                memory_bytes,
                port,
            },
        );

        Ok(port)
    }

    pub(crate) async fn running(&self) -> Vec<BackendStatus> {
        let state = self.state.lock().await;

        let mut statuses: Vec<BackendStatus> = state
            .backends
            .iter()
            .map(|(model, backend)| BackendStatus {
                model: model.clone(),
                port: backend.port,
                memory_bytes: backend.memory_bytes,
                idle_secs: backend.last_used.elapsed().as_secs(),
            })
            .collect();

        statuses.sort_by(|a, b| a.model.cmp(&b.model));

        statuses
    }

    /// Kills every backend.
    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;

        for (model, mut backend) in state.backends.drain() {
            Self::kill(&model, &mut backend.child).await;
        }
    }
}
