//! Realtime sessions: lock-free plan handoff between control and audio threads.
//!
//! [`session`] returns two halves:
//!
//! - [`RealtimeRenderer`] lives on the audio thread. Each call to
//!   [`render_block`](RealtimeRenderer::render_block) renders one block and
//!   never locks, allocates, or frees.
//! - [`SessionHandle`] lives on control threads. It submits new plans, compiles
//!   topologies in the background, exposes the current [`PlanMonitor`], and
//!   stops the session.
//!
//! Plans travel to the audio thread through a bounded channel of capacity one.
//! A newer submission replaces one the audio thread has not picked up yet. The
//! replaced plan travels back on a second bounded channel so it is dropped on a
//! control thread; the audio thread only swaps when that channel has room.
//!
//! A `loam-latency` worker thread recomputes latency compensation for the
//! current plan whenever a node reports a change.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use loam_core::{
    AudioBuffer, CompiledPlan, LatencyCompensator, PlanMonitor, ProcessContext, ProcessingMode,
    RenderEngine, Topology, compile_with,
};
use parking_lot::Mutex;

use crate::{BlockSink, EngineConfig, Error, Result};

/// Retired plans the audio thread may hand back before a control thread collects them.
const RETIRED_CAPACITY: usize = 4;

/// A compiled plan paired with render scratch sized for it.
///
/// Built on a control thread so the audio thread never allocates when it
/// switches plans.
pub struct ActivePlan {
    plan: CompiledPlan,
    engine: RenderEngine,
}

impl ActivePlan {
    /// Prepares `plan` for rendering.
    pub fn new(plan: CompiledPlan) -> Self {
        let engine = RenderEngine::for_plan(&plan);
        Self { plan, engine }
    }

    /// The plan.
    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }
}

/// State visible to both halves.
struct Shared {
    running: AtomicBool,
    monitor: ArcSwapOption<PlanMonitor>,
}

/// Creates a session for plans compiled with `config`'s block size.
pub fn session(config: &EngineConfig) -> Result<(SessionHandle, RealtimeRenderer)> {
    config.validate()?;

    let (plan_tx, plan_rx) = bounded::<Box<ActivePlan>>(1);
    let (retired_tx, retired_rx) = bounded::<Box<ActivePlan>>(RETIRED_CAPACITY);
    let (latency_tx, latency_rx) = unbounded::<LatencyCompensator>();
    let shared = Arc::new(Shared {
        running: AtomicBool::new(true),
        monitor: ArcSwapOption::empty(),
    });

    let worker = LatencyWorker {
        shared: Arc::clone(&shared),
        compensators: latency_rx,
        poll: config.latency_poll_interval(),
    };
    let worker = std::thread::Builder::new()
        .name("loam-latency".to_string())
        .spawn(move || worker.run())?;

    let stale = plan_rx.clone();
    let deadline_ns = config.block_deadline_ns();
    let renderer = RealtimeRenderer {
        plans: plan_rx,
        retired: retired_tx,
        pending: None,
        current: None,
        ctx: config.process_context(ProcessingMode::Realtime { deadline_ns }),
        silence: AudioBuffer::new(config.block_size, usize::from(config.channels)),
        shared: Arc::clone(&shared),
    };
    let handle = SessionHandle {
        inner: Arc::new(Inner {
            config: config.clone(),
            plans: plan_tx,
            stale,
            retired: retired_rx,
            latency: latency_tx,
            worker: Mutex::new(Some(worker)),
            shared,
        }),
    };

    tracing::info!(
        sample_rate = config.sample_rate,
        block_size = config.block_size,
        "realtime session started"
    );
    Ok((handle, renderer))
}

// ---------------------------------------------------------------------------
// Audio side
// ---------------------------------------------------------------------------

/// The audio-thread half of a session.
pub struct RealtimeRenderer {
    plans: Receiver<Box<ActivePlan>>,
    retired: Sender<Box<ActivePlan>>,
    pending: Option<Box<ActivePlan>>,
    current: Option<Box<ActivePlan>>,
    ctx: ProcessContext,
    silence: AudioBuffer,
    shared: Arc<Shared>,
}

impl RealtimeRenderer {
    /// Renders one block.
    ///
    /// Returns silence until the first plan arrives and `None` once the
    /// session has been stopped. Picks up a newly submitted plan at the block
    /// boundary.
    pub fn render_block(&mut self) -> Option<&AudioBuffer> {
        if !self.shared.running.load(Ordering::Acquire) {
            return None;
        }
        self.swap_plan();

        match self.current.as_deref_mut() {
            Some(active) => Some(active.engine.process(&mut active.plan, &mut self.ctx)),
            None => Some(&self.silence),
        }
    }

    /// Returns false once the session has been stopped.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Timing of the next block.
    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    /// Returns true if a plan is installed.
    pub fn has_plan(&self) -> bool {
        self.current.is_some()
    }

    fn swap_plan(&mut self) {
        if self.pending.is_none() {
            self.pending = self.plans.try_recv().ok();
        }
        let Some(next) = self.pending.take() else {
            return;
        };
        match self.current.take() {
            None => self.current = Some(next),
            Some(old) => match self.retired.try_send(old) {
                Ok(()) => self.current = Some(next),
                // No room to retire the old plan; keep it and retry next block.
                Err(TrySendError::Full(old) | TrySendError::Disconnected(old)) => {
                    self.current = Some(old);
                    self.pending = Some(next);
                }
            },
        }
    }
}

impl Drop for RealtimeRenderer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Control side
// ---------------------------------------------------------------------------

struct Inner {
    config: EngineConfig,
    plans: Sender<Box<ActivePlan>>,
    /// Drains a submission the audio thread has not picked up yet.
    stale: Receiver<Box<ActivePlan>>,
    retired: Receiver<Box<ActivePlan>>,
    latency: Sender<LatencyCompensator>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

/// The control half of a session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    /// The session's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Hands `plan` to the audio thread. The newest submission wins.
    pub fn submit(&self, plan: CompiledPlan) -> Result<()> {
        if !self.is_running() {
            return Err(Error::SessionClosed);
        }
        if plan.block_size() != self.inner.config.block_size {
            return Err(Error::InvalidConfig(format!(
                "plan block size {} does not match session block size {}",
                plan.block_size(),
                self.inner.config.block_size
            )));
        }

        let compensator = plan.compensator();
        let monitor = Arc::clone(plan.monitor());
        let nodes = plan.node_count();
        let mut next = Box::new(ActivePlan::new(plan));
        loop {
            match self.inner.plans.try_send(next) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    next = back;
                    if self.inner.stale.try_recv().is_ok() {
                        tracing::debug!("superseded a plan the renderer had not picked up");
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(Error::SessionClosed),
            }
        }

        self.inner.shared.monitor.store(Some(monitor));
        self.inner
            .latency
            .send(compensator)
            .map_err(|_| Error::SessionClosed)?;
        tracing::info!(nodes, "plan submitted");
        self.collect_garbage();
        Ok(())
    }

    /// Compiles `topology` on a background thread and submits the result.
    pub fn recompile(&self, topology: Topology) -> Result<CompileJob> {
        let handle = self.clone();
        let options = self.inner.config.compile_options();
        let thread = std::thread::Builder::new()
            .name("loam-compile".to_string())
            .spawn(move || {
                let plan = compile_with(topology, options).map_err(|failure| {
                    tracing::warn!(error = %failure.error, "background compile failed");
                    Error::Compile(failure.into_error())
                })?;
                handle.submit(plan)
            })?;
        Ok(CompileJob(thread))
    }

    /// Monitor of the most recently submitted plan.
    pub fn monitor(&self) -> Option<Arc<PlanMonitor>> {
        self.inner.shared.monitor.load_full()
    }

    /// Drops plans the audio thread has retired. Returns how many were dropped.
    pub fn collect_garbage(&self) -> usize {
        let mut dropped = 0;
        while let Ok(old) = self.inner.retired.try_recv() {
            drop(old);
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "retired plans collected");
        }
        dropped
    }

    /// Returns false once [`stop`](Self::stop) has been called.
    pub fn is_running(&self) -> bool {
        self.inner.shared.running.load(Ordering::Acquire)
    }

    /// Halts rendering and joins the latency worker.
    ///
    /// The audio thread sees the flag before its next block. Idempotent.
    pub fn stop(&self) {
        if self.inner.shared.running.swap(false, Ordering::AcqRel) {
            tracing::info!("realtime session stopping");
        }
        if let Some(worker) = self.inner.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("latency worker panicked");
            }
        }
        self.collect_garbage();
    }
}

/// A background compile started by [`SessionHandle::recompile`].
pub struct CompileJob(JoinHandle<Result<()>>);

impl CompileJob {
    /// Waits for the compile and submission to finish.
    pub fn join(self) -> Result<()> {
        self.0.join().map_err(|_| Error::CompileThreadPanicked)?
    }

    /// Returns true if the thread has finished.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

// ---------------------------------------------------------------------------
// Latency worker
// ---------------------------------------------------------------------------

struct LatencyWorker {
    shared: Arc<Shared>,
    compensators: Receiver<LatencyCompensator>,
    poll: Duration,
}

impl LatencyWorker {
    fn run(self) {
        tracing::debug!("latency worker started");
        let mut current: Option<LatencyCompensator> = None;
        while self.shared.running.load(Ordering::Acquire) {
            match self.compensators.recv_timeout(self.poll) {
                Ok(next) => {
                    next.refresh();
                    current = Some(next);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(report) = current.as_ref().and_then(|c| c.refresh_if_dirty()) {
                        tracing::debug!(
                            changed = report.changed,
                            misaligned = report.misaligned,
                            max_compensation = report.max_compensation,
                            "latency compensation updated"
                        );
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("latency worker stopped");
    }
}

/// Drives `renderer` on a new thread, writing every block to `sink`.
///
/// Sleeps `pace` between blocks when given; without it the loop runs as fast
/// as it can. Ends when the session is stopped and returns the number of
/// blocks written.
pub fn spawn_render_loop<S>(
    mut renderer: RealtimeRenderer,
    mut sink: S,
    pace: Option<Duration>,
) -> Result<JoinHandle<Result<u64>>>
where
    S: BlockSink + Send + 'static,
{
    let thread = std::thread::Builder::new()
        .name("loam-render".to_string())
        .spawn(move || {
            let mut blocks = 0u64;
            while let Some(block) = renderer.render_block() {
                sink.write_block(block.as_slice(), block.channels())?;
                blocks += 1;
                if let Some(pace) = pace {
                    std::thread::sleep(pace);
                }
            }
            sink.finish()?;
            Ok(blocks)
        })?;
    Ok(thread)
}
