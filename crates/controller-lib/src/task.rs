//! Periodic background jobs
//!
//! One loop implementation shared by the pusher, the housekeeper and the
//! secret monitor:
//! - Ticks on a fixed interval, the first one after a full interval
//! - Each tick runs in its own task, so a panic is logged and the loop keeps going
//! - Stopping signals [`Shutdown`], waits for the running tick, then runs
//!   [`PeriodicJob::on_shutdown`] once

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Cancellation signal observed by running jobs.
///
/// Cheap to clone. A `Shutdown` whose trigger has been dropped never fires.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// The sending half of a [`Shutdown`]
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// A signal that is never raised, for one-off calls outside a loop
    pub fn never() -> Shutdown {
        let (_, shutdown) = Self::new();
        shutdown
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled
    pub async fn signalled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // trigger dropped without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

impl ShutdownTrigger {
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }
}

/// Work run on a fixed interval
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One unit of work. Errors are logged; the loop continues.
    async fn tick(&self, shutdown: &Shutdown) -> anyhow::Result<()>;

    /// Runs once after the loop stops
    async fn on_shutdown(&self, _shutdown: &Shutdown) {}
}

/// Handle to a running periodic loop
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    trigger: ShutdownTrigger,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the loop, including `on_shutdown`, to finish.
    pub async fn stop(self) {
        self.trigger.signal();
        if let Err(e) = self.join.await {
            error!(task = self.name, error = %e, "Periodic task ended abnormally");
        }
        debug!(task = self.name, "Periodic task stopped");
    }
}

/// Start `job` on its interval.
pub fn spawn_periodic<J: PeriodicJob>(job: Arc<J>) -> TaskHandle {
    let (trigger, shutdown) = Shutdown::new();
    let name = job.name();
    let join = tokio::spawn(run_loop(job, shutdown));
    TaskHandle {
        name,
        trigger,
        join,
    }
}

async fn run_loop<J: PeriodicJob>(job: Arc<J>, shutdown: Shutdown) {
    // tokio intervals reject a zero period
    let period = job.interval().max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(task = job.name(), interval_ms = period.as_millis() as u64, "Starting periodic task");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.signalled() => break,
            _ = ticker.tick() => {
                let tick_job = Arc::clone(&job);
                let tick_shutdown = shutdown.clone();
                let outcome = tokio::spawn(async move { tick_job.tick(&tick_shutdown).await }).await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = job.name(), error = %e, "Periodic task tick failed"),
                    Err(e) if e.is_panic() => {
                        error!(task = job.name(), panic = %panic_message(e), "Recovered from panic in periodic task")
                    }
                    Err(e) => warn!(task = job.name(), error = %e, "Periodic task tick cancelled"),
                }
            }
        }
    }

    info!(task = job.name(), "Shutting down periodic task");
    let final_job = Arc::clone(&job);
    let final_shutdown = shutdown.clone();
    if let Err(e) = tokio::spawn(async move { final_job.on_shutdown(&final_shutdown).await }).await {
        error!(task = job.name(), error = %e, "Periodic task shutdown hook failed");
    }
}

fn panic_message(e: tokio::task::JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Restartable wrapper giving a job `start`/`shutdown`/`is_running`.
pub struct BackgroundService<J: PeriodicJob> {
    job: Arc<J>,
    handle: Mutex<Option<TaskHandle>>,
}

impl<J: PeriodicJob> BackgroundService<J> {
    pub fn new(job: J) -> Self {
        Self::from_arc(Arc::new(job))
    }

    pub fn from_arc(job: Arc<J>) -> Self {
        Self {
            job,
            handle: Mutex::new(None),
        }
    }

    pub fn job(&self) -> &Arc<J> {
        &self.job
    }

    /// Start the loop; does nothing if it is already running.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *handle = Some(spawn_periodic(Arc::clone(&self.job)));
    }

    /// Stop the loop and wait for it; `start` may be called again afterwards.
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
