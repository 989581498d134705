//! Memory-pressure feedback controller
//!
//! One controller per node aggregates the "queue duration" every registered
//! queue reports: the seconds the queue expects its current backlog to last,
//! or infinity for no backlog pressure at all. From the node's memory usage
//! ratio the controller derives a target duration and feeds it back, so that
//! queues collectively shrink what they hold in memory as the node fills up.
//!
//! The loop only pushes proactively when the target *decreases*: queues are
//! safe holding data longer than they were told, but a shrinking target must
//! reach hibernating queues promptly. Growth travels lazily in the reply to
//! each queue's next report. An oscillation guard keeps a queue that briefly
//! dips below one second from flapping between infinity and tiny targets
//! right after being told there is no pressure.
//!
//! All controller state lives inside one spawned task; callers talk to it
//! through [`MemoryMonitor`], a cheap cloneable handle. Reports are answered
//! before the bookkeeping they trigger, so a queue never waits on the
//! controller's own accounting.

pub mod oracle;


use crate::config::MemoryMonitorConfig;
use crate::{PulsemqError, Result};
use oracle::MemoryOracle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Opaque identity of a registered queue
pub type QueueId = u64;

/// Deferred push-back invocation: applied with a target duration (or
/// infinity), it delivers the target to the queue
pub type PushbackFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Fraction of the raw VM limit used as the working budget
pub const MEMORY_SCALE: f64 = 0.6;
/// Below this memory ratio every target is infinity
pub const LIMIT_THRESHOLD: f64 = 0.5;
/// Below this memory ratio the duration sum is inflated
pub const SUM_INFLATION_THRESHOLD: f64 = 0.95;
/// Additive sum inflation
pub const SUM_INFLATION_AMOUNT: f64 = 1.0;
/// Smallest reported duration that escapes the infinity oscillation guard
pub const OSCILLATION_GUARD: f64 = 1.0;
/// Sum magnitudes below this clamp to zero
pub const EPSILON: f64 = 1e-6;
/// Fallback raw limit when the VM memory oracle is unavailable
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;

/// Handle to the node's memory-pressure controller task
#[derive(Clone)]
pub struct MemoryMonitor {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

enum Command {
    Register {
        queue: QueueId,
        pushback: PushbackFn,
        reply: oneshot::Sender<()>,
    },
    Deregister {
        queue: QueueId,
        reply: oneshot::Sender<()>,
    },
    QueueDown {
        queue: QueueId,
    },
    Report {
        queue: QueueId,
        duration: f64,
        reply: oneshot::Sender<f64>,
    },
    Update {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

impl MemoryMonitor {
    /// Spawn the controller task
    ///
    /// The working budget is fixed here: [`MEMORY_SCALE`] of the oracle's raw
    /// limit, falling back to [`DEFAULT_MEMORY_LIMIT_BYTES`] when the oracle
    /// reports the limit unavailable.
    pub fn start(config: MemoryMonitorConfig, oracle: Arc<dyn MemoryOracle>) -> Self {
        let raw_limit = oracle.limit_bytes().unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES);
        let memory_limit = ((raw_limit as f64 * MEMORY_SCALE) as u64).max(1);
        info!(
            "Memory monitor starting with a working budget of {} bytes",
            memory_limit
        );
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let state = ControllerState {
            entries: HashMap::new(),
            sum: 0.0,
            count: 0,
            memory_limit,
            desired: f64::INFINITY,
            oracle,
        };
        tokio::spawn(state.run(cmd_rx, config.update_interval()));
        Self { cmd_tx }
    }

    /// Register a queue and begin tracking it; the queue starts with no
    /// reported duration and no sent target
    pub async fn register(&self, queue: QueueId, pushback: PushbackFn) -> Result<()> {
        self.request(|reply| Command::Register {
            queue,
            pushback,
            reply,
        })
        .await
    }

    /// Forget a queue. Idempotent.
    pub async fn deregister(&self, queue: QueueId) -> Result<()> {
        self.request(|reply| Command::Deregister { queue, reply })
            .await
    }

    /// Notification that a registered queue's process died; same effect as
    /// deregistering it
    pub fn queue_down(&self, queue: QueueId) {
        let _ = self.cmd_tx.send(Command::QueueDown { queue });
    }

    /// Report the queue's expected backlog duration in seconds (or infinity
    /// for none) and receive the target the queue should adopt
    pub async fn report_queue_duration(&self, queue: QueueId, duration: f64) -> Result<f64> {
        self.request(|reply| Command::Report {
            queue,
            duration,
            reply,
        })
        .await
    }

    /// Run one control-loop pass now, in addition to the periodic ones
    pub async fn update(&self) -> Result<()> {
        self.request(|reply| Command::Update { reply }).await
    }

    /// Stop the controller task
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .map_err(|_| PulsemqError::Monitor("memory monitor is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| PulsemqError::Monitor("memory monitor dropped the request".to_string()))
    }
}

/// Per-queue tracking entry, owned by the controller task
struct ProcessEntry {
    /// Last reported duration
    reported: f64,
    /// Last target sent to the queue
    sent: f64,
    pushback: PushbackFn,
}

struct ControllerState {
    entries: HashMap<QueueId, ProcessEntry>,
    /// Sum of the finite reported durations, zero-clamped below [`EPSILON`]
    sum: f64,
    /// Number of entries with a finite reported duration
    count: usize,
    memory_limit: u64,
    desired: f64,
    oracle: Arc<dyn MemoryOracle>,
}

impl ControllerState {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => self.update(),
            }
        }
        debug!("Memory monitor stopped");
    }

    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Register {
                queue,
                pushback,
                reply,
            } => {
                let _ = reply.send(());
                self.register(queue, pushback);
            }
            Command::Deregister { queue, reply } => {
                let _ = reply.send(());
                self.deregister(queue);
            }
            Command::QueueDown { queue } => self.deregister(queue),
            Command::Report {
                queue,
                duration,
                reply,
            } => {
                // Unblock the queue before doing our own accounting.
                let answer = self.immediate_reply(queue, duration);
                let _ = reply.send(answer);
                self.absorb_report(queue, duration, answer);
            }
            Command::Update { reply } => {
                self.update();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn register(&mut self, queue: QueueId, pushback: PushbackFn) {
        if self.entries.contains_key(&queue) {
            self.deregister(queue);
        }
        debug!("Registering queue {}", queue);
        self.entries.insert(
            queue,
            ProcessEntry {
                reported: f64::INFINITY,
                sent: f64::INFINITY,
                pushback,
            },
        );
    }

    fn deregister(&mut self, queue: QueueId) {
        if let Some(entry) = self.entries.remove(&queue) {
            debug!("Deregistering queue {}", queue);
            if entry.reported.is_finite() {
                self.sum = zero_clamp(self.sum - entry.reported);
                self.count -= 1;
            }
        }
    }

    fn immediate_reply(&self, queue: QueueId, duration: f64) -> f64 {
        match self.entries.get(&queue) {
            // A queue that was just told "no pressure" and briefly dips
            // below the guard keeps hearing infinity.
            Some(entry)
                if duration.is_finite()
                    && entry.sent.is_infinite()
                    && duration < OSCILLATION_GUARD =>
            {
                f64::INFINITY
            }
            Some(_) => self.desired,
            None => {
                warn!("Queue {} reported a duration without registering", queue);
                self.desired
            }
        }
    }

    fn absorb_report(&mut self, queue: QueueId, duration: f64, answered: f64) {
        let Some(entry) = self.entries.get_mut(&queue) else {
            return;
        };
        let previous = entry.reported;
        match (previous.is_finite(), duration.is_finite()) {
            (false, false) => {}
            (false, true) => {
                self.sum = zero_clamp(self.sum + duration);
                self.count += 1;
            }
            (true, false) => {
                self.sum = zero_clamp(self.sum - previous);
                self.count -= 1;
            }
            (true, true) => {
                self.sum = zero_clamp(self.sum + duration - previous);
            }
        }
        entry.reported = duration;
        entry.sent = answered;
    }

    /// One control-loop pass: recompute the target and push it to the
    /// queues that need to hear it
    fn update(&mut self) {
        let used = self.oracle.used_bytes();
        let ratio = used as f64 / self.memory_limit as f64;
        let target = if ratio < LIMIT_THRESHOLD || self.count == 0 {
            f64::INFINITY
        } else {
            let sum = if ratio < SUM_INFLATION_THRESHOLD {
                self.sum + SUM_INFLATION_AMOUNT
            } else {
                self.sum
            };
            (sum / self.count as f64) / ratio
        };

        // Only inform queues proactively when the target decreases; growth
        // reaches each queue in the reply to its next report.
        if target.is_finite() && (self.desired.is_infinite() || target < self.desired) {
            self.push_back(target);
        }
        self.desired = target;
    }

    fn push_back(&mut self, target: f64) {
        for (queue, entry) in self.entries.iter_mut() {
            let push = match (entry.reported.is_finite(), entry.sent.is_finite()) {
                (false, false) => true,
                (false, true) => target < entry.sent,
                (true, false) => {
                    target < entry.reported && entry.reported >= OSCILLATION_GUARD
                }
                (true, true) => target < entry.reported.min(entry.sent),
            };
            if push {
                debug!("Pushing target duration {} to queue {}", target, queue);
                (entry.pushback)(target);
                entry.sent = target;
            }
        }
    }
}

fn zero_clamp(sum: f64) -> f64 {
    if sum.abs() < EPSILON {
        0.0
    } else {
        sum
    }
}
