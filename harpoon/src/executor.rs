// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Running the command under trace.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{CaptureError, CaptureOptions};

/// How long a killed child gets to be reaped before we stop waiting for it.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// A spawned child. `exit` resolves once the child has terminated and its
/// relayed streams have been drained.
pub struct Execution {
    pub stdout: Option<UnboundedReceiver<String>>,
    pub stderr: Option<UnboundedReceiver<String>>,
    pub exit: JoinHandle<io::Result<ExitStatus>>,
    kill: CancellationToken,
}

impl Execution {
    /// Asks the child to die; `exit` still has to be awaited.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

fn relay<R>(stream: R, lines: UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("could not relay command output: {e}");
                    break;
                }
            }
        }
    })
}

fn piped_if(relayed: bool) -> Stdio {
    if relayed {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Starts `argv`, relaying its output line by line when requested.
pub fn spawn(argv: &[String], options: &CaptureOptions) -> Result<Execution, CaptureError> {
    let (program, args) = argv.split_first().ok_or(CaptureError::EmptyCommand)?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(piped_if(options.command_output))
        .stderr(piped_if(options.command_error))
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CaptureError::Spawn {
            command: program.clone(),
            source,
        })?;
    debug!("started {program} (pid {:?})", child.id());

    let mut relays = Vec::new();
    let stdout = child.stdout.take().map(|stream| {
        let (tx, rx) = mpsc::unbounded_channel();
        relays.push(relay(stream, tx));
        rx
    });
    let stderr = child.stderr.take().map(|stream| {
        let (tx, rx) = mpsc::unbounded_channel();
        relays.push(relay(stream, tx));
        rx
    });

    let kill = CancellationToken::new();
    let killed = kill.clone();
    let exit = tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = killed.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!("could not kill child: {e}");
                }
                match time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "child did not exit after being killed",
                        ))
                    }
                }
            }
        };

        // grandchildren may still hold the pipes open after a kill
        for relay in relays {
            if killed.is_cancelled() {
                if time::timeout(KILL_GRACE, relay).await.is_err() {
                    debug!("gave up draining output of killed child");
                }
            } else if let Err(e) = relay.await {
                warn!("output relay failed: {e}");
            }
        }

        Ok(status)
    });

    Ok(Execution {
        stdout,
        stderr,
        exit,
        kill,
    })
}
