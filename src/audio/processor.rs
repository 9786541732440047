//! The single background worker that turns queued entries into playable media.
//!
//! Exactly one pipeline runs process-wide at a time. Each loop iteration asks
//! every registered queue for its candidate (the current entry if it still
//! needs processing, otherwise the first pending one) and lets a
//! [`SelectionPolicy`] choose among them.
//!
//! With [`DepthFirst`] the first queue in registry order always wins, so a busy
//! queue created early can starve queues created later. That is the default
//! behaviour; [`RoundRobin`] is available when fairness across channels
//! matters more.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{entry::Entry, pipeline::Pipeline, registry::QueueRegistry};
use crate::error::PipelineError;

/// "Hay trabajo nuevo". Notifying while nobody waits stores a permit, so a
/// signal sent during a scan is never lost.
#[derive(Debug, Default)]
pub struct WorkSignal {
    notify: Notify,
    count: AtomicU64,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Total notifications so far.
    pub fn notifications(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

pub trait SelectionPolicy: Send + Sync {
    /// `candidates[i]` is the candidate of the i-th queue in registry order.
    fn pick(&mut self, candidates: Vec<Option<Arc<Entry>>>) -> Option<Arc<Entry>>;
}

/// First queue with work wins.
#[derive(Debug, Default)]
pub struct DepthFirst;

impl SelectionPolicy for DepthFirst {
    fn pick(&mut self, candidates: Vec<Option<Arc<Entry>>>) -> Option<Arc<Entry>> {
        candidates.into_iter().flatten().next()
    }
}

/// Starts scanning after the queue served last.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl SelectionPolicy for RoundRobin {
    fn pick(&mut self, candidates: Vec<Option<Arc<Entry>>>) -> Option<Arc<Entry>> {
        let len = candidates.len();
        if len == 0 {
            return None;
        }
        let start = self.next % len;
        let mut candidates: Vec<_> = candidates.into_iter().map(Some).collect();
        for offset in 0..len {
            let index = (start + offset) % len;
            if let Some(Some(entry)) = candidates[index].take() {
                self.next = index + 1;
                return Some(entry);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    DepthFirst,
    RoundRobin,
}

impl PolicyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "depth-first" | "depth_first" | "depthfirst" => Some(PolicyKind::DepthFirst),
            "round-robin" | "round_robin" | "roundrobin" => Some(PolicyKind::RoundRobin),
            _ => None,
        }
    }

    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            PolicyKind::DepthFirst => Box::new(DepthFirst),
            PolicyKind::RoundRobin => Box::<RoundRobin>::default(),
        }
    }
}

pub struct BackgroundProcessor {
    registry: Arc<QueueRegistry>,
    signal: Arc<WorkSignal>,
    pipeline: Arc<Pipeline>,
    policy: Box<dyn SelectionPolicy>,
}

impl BackgroundProcessor {
    pub fn new(
        registry: Arc<QueueRegistry>,
        signal: Arc<WorkSignal>,
        pipeline: Arc<Pipeline>,
        policy: Box<dyn SelectionPolicy>,
    ) -> Self {
        Self {
            registry,
            signal,
            pipeline,
            policy,
        }
    }

    /// Scans every queue under its lock and picks the next entry.
    pub async fn select_next(&mut self) -> Option<Arc<Entry>> {
        let mut candidates = Vec::new();
        for queue in self.registry.snapshot() {
            candidates.push(queue.lock().await.candidate());
        }
        self.policy.pick(candidates)
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("⚙️ Procesador en segundo plano iniciado");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.select_next().await {
                Some(entry) => self.process(entry, &shutdown).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.signal.wait() => {}
                    }
                }
            }
        }
        info!("👋 Procesador detenido");
    }

    /// Runs one entry's pipeline to completion. Panics inside the pipeline end
    /// up on the entry instead of taking the loop down.
    pub async fn process(&self, entry: Arc<Entry>, shutdown: &CancellationToken) {
        let Some(run) = entry.begin_processing(shutdown) else {
            return;
        };
        debug!("🎞️ Procesando {} (gen {})", entry.title(), run.generation);

        let pipeline = self.pipeline.clone();
        let task_entry = entry.clone();
        let task_run = run.clone();
        let handle = tokio::spawn(async move { pipeline.run(&task_entry, &task_run).await });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!("💥 El pipeline de {} entró en pánico", entry.title());
                Err(PipelineError::Panicked)
            }
            Err(_) => Err(PipelineError::Cancelled),
        };
        entry.finish(run.generation, outcome, shutdown.is_cancelled());
    }
}
