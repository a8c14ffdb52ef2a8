// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Turning raw kernel samples into syscall id batches while the target runs.

use std::io;
use std::mem;
use std::process::ExitStatus;
use std::time::Duration;

use bytes::Bytes;
use harpoon_common::SyscallEvent;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::executor::{self, Execution};

/// Quiet period after the child exits before the last samples are assumed
/// to have arrived.
const DRAIN_QUIET: Duration = Duration::from_millis(100);
const DRAIN_LIMIT: Duration = Duration::from_secs(1);

const BATCH_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no command to run")]
    EmptyCommand,

    #[error("could not start `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("could not wait for the traced command")]
    Wait(#[source] io::Error),

    #[error("malformed syscall event ({len} bytes)")]
    Decode { len: usize },

    #[error("lost {count} syscall event(s), capture is incomplete")]
    EventsLost { count: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Relay the command's stdout.
    pub command_output: bool,
    /// Relay the command's stderr.
    pub command_error: bool,
    /// Emit a batch every period instead of once at the end. A period
    /// without syscalls still yields an (empty) batch.
    pub dump_interval: Option<Duration>,
}

/// Raw samples and loss counts coming out of the kernel-side output map.
/// Both channels close once the producer stops.
pub struct EventStream {
    pub events: Receiver<Bytes>,
    pub lost: Receiver<u64>,
}

/// A running capture.
///
/// `batches` and `errors` close once the capture is over; the last batch is
/// only sent after the command has exited and its output was drained.
pub struct Capture {
    pub batches: Receiver<Vec<u32>>,
    pub errors: Receiver<CaptureError>,
    pub stdout: Option<UnboundedReceiver<String>>,
    pub stderr: Option<UnboundedReceiver<String>>,
    task: JoinHandle<()>,
}

impl Capture {
    /// Waits for the capture task itself to wind down.
    pub async fn finished(&mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }

    /// Consumes every batch, failing on the first reported error.
    pub async fn collect(mut self) -> Result<Vec<Vec<u32>>, CaptureError> {
        let mut batches = Vec::new();
        let mut failure = None;
        let (mut batches_open, mut errors_open) = (true, true);
        while batches_open || errors_open {
            tokio::select! {
                batch = self.batches.recv(), if batches_open => match batch {
                    Some(batch) => batches.push(batch),
                    None => batches_open = false,
                },
                error = self.errors.recv(), if errors_open => match error {
                    Some(error) => {
                        failure.get_or_insert(error);
                    }
                    None => errors_open = false,
                },
            }
        }
        if let Err(e) = self.finished().await {
            warn!("capture task failed: {e}");
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(batches),
        }
    }
}

enum Outcome {
    Exited(Result<ExitStatus, CaptureError>),
    Cancelled,
    Failed,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn exit_result(joined: Result<io::Result<ExitStatus>, JoinError>) -> Result<ExitStatus, CaptureError> {
    match joined {
        Ok(status) => status.map_err(CaptureError::Wait),
        Err(e) => Err(CaptureError::Wait(io::Error::other(e))),
    }
}

async fn stop(execution: Execution) {
    execution.kill();
    match exit_result(execution.exit.await) {
        Ok(status) => debug!("killed command exited with {status}"),
        Err(e) => debug!("killed command: {e}"),
    }
}

struct Pipeline {
    events: EventStream,
    batches: Sender<Vec<u32>>,
    errors: Sender<CaptureError>,
    accumulator: Vec<u32>,
}

impl Pipeline {
    fn record(&mut self, raw: &[u8]) -> Result<(), CaptureError> {
        let event = SyscallEvent::decode(raw).ok_or(CaptureError::Decode { len: raw.len() })?;
        self.accumulator.push(event.syscall_id);
        Ok(())
    }

    async fn fail(&self, error: CaptureError) {
        warn!("capture stopped: {error}");
        let _ = self.errors.send(error).await;
    }

    async fn emit(&mut self) {
        let batch = mem::take(&mut self.accumulator);
        debug!("emitting batch of {} syscall(s)", batch.len());
        if self.batches.send(batch).await.is_err() {
            debug!("nobody is listening for batches");
        }
    }

    async fn run(
        mut self,
        mut execution: Execution,
        interval: Option<Duration>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval.map(|period| {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let (mut events_open, mut lost_open) = (true, true);
        // cleared by a malformed sample; the command keeps running unobserved
        let mut decoding = true;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                sample = self.events.events.recv(), if events_open && decoding => match sample {
                    Some(raw) => {
                        if let Err(e) = self.record(&raw) {
                            self.fail(e).await;
                            self.accumulator.clear();
                            decoding = false;
                        }
                    }
                    None => events_open = false,
                },
                lost = self.events.lost.recv(), if lost_open && decoding => match lost {
                    Some(count) => {
                        self.fail(CaptureError::EventsLost { count }).await;
                        break Outcome::Failed;
                    }
                    None => lost_open = false,
                },
                _ = tick(&mut ticker), if decoding => self.emit().await,
                joined = &mut execution.exit => break Outcome::Exited(exit_result(joined)),
            }
        };

        match outcome {
            Outcome::Exited(Ok(status)) if !decoding => {
                info!("traced command exited with {status}, its syscalls were not recorded");
            }
            Outcome::Exited(Ok(status)) => {
                info!("traced command exited with {status}");
                if let Err(e) = self.drain().await {
                    self.fail(e).await;
                    return;
                }
                self.emit().await;
            }
            Outcome::Exited(Err(e)) => self.fail(e).await,
            Outcome::Cancelled => {
                info!("capture cancelled");
                stop(execution).await;
            }
            Outcome::Failed => stop(execution).await,
        }
    }

    /// Picks up samples still in flight when the child exited.
    async fn drain(&mut self) -> Result<(), CaptureError> {
        let deadline = Instant::now() + DRAIN_LIMIT;
        loop {
            let next = time::timeout(DRAIN_QUIET, self.events.events.recv());
            match time::timeout_at(deadline, next).await {
                Ok(Ok(Some(raw))) => self.record(&raw)?,
                _ => break,
            }
        }
        match self.events.lost.try_recv() {
            Ok(count) => Err(CaptureError::EventsLost { count }),
            Err(_) => Ok(()),
        }
    }
}

/// Starts `command` and a task that turns `events` into batches until the
/// command exits, a loss is reported or `cancel` fires. A loss or a
/// cancellation kills the command. A malformed sample stops decoding but
/// lets the command run to completion. Only a clean exit with every sample
/// decoded sends the final batch.
pub fn capture(
    command: &[String],
    options: CaptureOptions,
    events: EventStream,
    cancel: CancellationToken,
) -> Result<Capture, CaptureError> {
    let mut execution = executor::spawn(command, &options)?;
    let stdout = execution.stdout.take();
    let stderr = execution.stderr.take();

    let (batches_tx, batches) = mpsc::channel(BATCH_QUEUE);
    let (errors_tx, errors) = mpsc::channel(BATCH_QUEUE);
    let pipeline = Pipeline {
        events,
        batches: batches_tx,
        errors: errors_tx,
        accumulator: Vec::new(),
    };
    let task = tokio::spawn(pipeline.run(execution, options.dump_interval, cancel));

    Ok(Capture {
        batches,
        errors,
        stdout,
        stderr,
        task,
    })
}
