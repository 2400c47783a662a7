//! Restart controller.
//!
//! Drives one elementary stream through its open/stream/drain cycle and
//! chains clips: when the producer's stream ends, the endpoint is reopened
//! and playback resumes on the same RTP numbering space.
//!
//! ```text
//! Idle -> Opening -> Streaming -> Draining -> Opening -> Streaming -> ...
//!            |                                   |
//!            +-> Failed (first open)             +-> Failed (reopen attempts exhausted)
//! ```
//!
//! The controller is the single consumer of its sink's completions. A
//! completion that does not carry the currently bound framer's identity
//! is stale and ignored.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RestartPolicy;
use crate::error::{Result, StreamError};
use crate::framer::{Framer, FramerFactory, FramerId};
use crate::sink::{Completion, RtpSink};
use crate::subsession::MulticastGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Opening,
    Streaming,
    Draining,
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the controller holds its sink across cycles.
pub enum SinkBinding {
    /// On-demand: one sink for every cycle; only the framer is recreated.
    Persistent(RtpSink),
    /// Multicast: a new sink per cycle on the group's long-lived channel.
    PerCycle {
        group: Arc<MulticastGroup>,
        sink: RtpSink,
    },
}

impl SinkBinding {
    fn sink_mut(&mut self) -> &mut RtpSink {
        match self {
            Self::Persistent(sink) => sink,
            Self::PerCycle { sink, .. } => sink,
        }
    }

    /// Prepare the sink for the next cycle.
    fn recycle(&mut self) {
        if let Self::PerCycle { group, sink } = self {
            let next = sink.renewed();
            group.install_packetizer(next.packetizer());
            *sink = next;
        }
    }

    /// The sink, if it outlives the controller.
    pub fn into_persistent(self) -> Option<RtpSink> {
        match self {
            Self::Persistent(sink) => Some(sink),
            Self::PerCycle { .. } => None,
        }
    }
}

pub struct RestartController {
    label: String,
    factory: FramerFactory,
    binding: SinkBinding,
    policy: RestartPolicy,
    state_tx: watch::Sender<ControllerState>,
    transitions: Arc<AtomicU64>,
    cycle: u64,
    bound: Option<FramerId>,
    completion: Option<oneshot::Receiver<Completion>>,
}

impl RestartController {
    pub fn new(
        label: impl Into<String>,
        factory: FramerFactory,
        binding: SinkBinding,
        policy: RestartPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            label: label.into(),
            factory,
            binding,
            policy,
            state_tx,
            transitions: Arc::new(AtomicU64::new(0)),
            cycle: 0,
            bound: None,
            completion: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Number of state transitions so far.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Completed open/stream cycles, counting the current one.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn bound_framer(&self) -> Option<FramerId> {
        self.bound
    }

    pub fn into_binding(self) -> SinkBinding {
        self.binding
    }

    fn transition(&mut self, to: ControllerState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.transitions.fetch_add(1, Ordering::SeqCst);
        self.state_tx.send_replace(to);
        tracing::debug!(track = %self.label, %from, state = %to, "controller transition");
    }

    /// First open: `Idle -> Opening -> Streaming`, or `Failed` when the
    /// endpoint cannot be opened. There is no retry here.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ControllerState::Idle {
            return Err(StreamError::AlreadyPlaying);
        }
        self.transition(ControllerState::Opening);
        match self.factory.open().await {
            Ok(framer) => self.attach(framer),
            Err(e) => {
                tracing::warn!(track = %self.label, endpoint = %self.factory.endpoint, error = %e, "endpoint open failed");
                self.transition(ControllerState::Failed);
                Err(e)
            }
        }
    }

    fn attach(&mut self, framer: Framer) -> Result<()> {
        let handle = match self.binding.sink_mut().start_playing(framer) {
            Ok(handle) => handle,
            Err(e) => {
                self.transition(ControllerState::Failed);
                return Err(e);
            }
        };
        self.bound = Some(handle.framer);
        self.completion = Some(handle.completion);
        self.cycle += 1;
        tracing::info!(track = %self.label, cycle = self.cycle, framer = %handle.framer, "streaming");
        self.transition(ControllerState::Streaming);
        Ok(())
    }

    /// Handle a play completion.
    ///
    /// A current completion drains the cycle and reopens the endpoint,
    /// retrying per the restart policy. A stale one changes nothing.
    pub async fn on_completion(&mut self, completion: Completion) -> Result<()> {
        if self.bound != Some(completion.framer) {
            tracing::debug!(
                track = %self.label,
                framer = %completion.framer,
                bound = ?self.bound,
                "ignoring stale completion"
            );
            return Ok(());
        }

        self.transition(ControllerState::Draining);
        self.completion = None;
        self.bound = None;
        // The old framer, and with it its source, is gone before the next open.
        drop(self.binding.sink_mut().stop_playing().await);
        self.binding.recycle();

        self.transition(ControllerState::Opening);
        if completion.units == 0 {
            // An endpoint that ends without data would otherwise spin.
            tokio::time::sleep(self.policy.reopen_delay).await;
        }
        self.reopen().await
    }

    async fn reopen(&mut self) -> Result<()> {
        let attempts = self.policy.reopen_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.factory.open().await {
                Ok(framer) => return self.attach(framer),
                Err(e) if attempt >= attempts => {
                    tracing::error!(
                        track = %self.label,
                        endpoint = %self.factory.endpoint,
                        attempts,
                        error = %e,
                        "giving up reopening endpoint"
                    );
                    self.transition(ControllerState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(track = %self.label, attempt, error = %e, "reopen failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.policy.reopen_delay).await;
                }
            }
        }
    }

    /// Stop the sink and return to `Idle`.
    pub async fn shutdown(&mut self) {
        self.completion = None;
        self.bound = None;
        drop(self.binding.sink_mut().stop_playing().await);
        if self.state() != ControllerState::Failed {
            self.transition(ControllerState::Idle);
        }
    }

    /// Run cycles until `shutdown` fires (or its sender is dropped) or an
    /// endpoint stays unavailable.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        loop {
            let Some(mut completion) = self.completion.take() else {
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.shutdown().await;
                    return Ok(());
                }
                done = &mut completion => {
                    let done = match done {
                        Ok(done) => done,
                        // Play task ended without reporting; treat as end of stream.
                        Err(_) => match self.bound {
                            Some(framer) => Completion { framer, units: 0 },
                            None => return Ok(()),
                        },
                    };
                    self.on_completion(done).await?;
                }
            }
        }
    }
}

/// A controller running on its own task.
pub struct ControllerHandle {
    label: String,
    state: watch::Receiver<ControllerState>,
    transitions: Arc<AtomicU64>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<(RestartController, Result<()>)>>,
}

impl ControllerHandle {
    pub fn spawn(mut controller: RestartController) -> Self {
        let label = controller.label.clone();
        let state = controller.subscribe();
        let transitions = controller.transitions.clone();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let result = controller.run(stop_rx).await;
            (controller, result)
        });
        Self {
            label,
            state,
            transitions,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::SeqCst)
    }

    /// Stop the controller and hand back its sink if it outlives it.
    pub async fn stop(mut self) -> Option<RtpSink> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let task = self.task.take()?;
        match task.await {
            Ok((controller, _)) => controller.into_binding().into_persistent(),
            Err(e) => {
                tracing::warn!(track = %self.label, error = %e, "controller task failed");
                None
            }
        }
    }

    /// Wait for the controller to end on its own. Returns its error.
    pub async fn join(mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok((_, result)) => result,
            Err(_) => Err(StreamError::ControllerStopped),
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
