//! Periodic network self-diagnosis
//!
//! Each tick writes a transcript: the prompt built from `ip -br address
//! show`, the model's streamed answer, and the output of any command the
//! model asked for. The transcript flows through a bounded pipe into a
//! [`Muxer`], so any number of HTTP clients can replay it from the start
//! while it is still being written.
//!
//! [`HealthRegistry`] is the single task owning the transcripts. It keeps the
//! newest few, keyed by the unix second their tick started.

use crate::inference::{Inference, InferenceError};
use crate::probe::{CommandRunner, ProbeError};
use futures::StreamExt;
use sdwan_net::Muxer;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const INST_OPEN: &str = "[INST]";
const INST_CLOSE: &str = "[/INST]";
const UNHEALTHY: &str = "UNHEALTHY";

/// Capacity of the in-memory pipe feeding a transcript muxer
const PIPE_CAPACITY: usize = 64 * 1024;

/// Instructions sent ahead of the interface listing
pub const DIAGNOSIS_PROMPT: &str = "
You check the network configuration of a branch router.
Answer HEALTHY when the configuration looks sound.
Answer UNHEALTHY when something looks wrong, then give exactly one shell command
for further diagnosis on its own line, prefixed with \"$ \".

Example:
HEALTHY
All interfaces are up and addressed.

Example:
UNHEALTHY
$ ip -br link show
eth1 has no address, so look at its link state next.
";

/// Diagnostics errors
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Health registry stopped")]
    Closed,
}

/// One turn of a transcript
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Remark<'a> {
    /// Inside `[INST]` markers: prompt or command feedback
    pub user: bool,
    pub content: &'a str,
}

/// Split a transcript into user and assistant remarks.
///
/// An unterminated `[INST]` ends the split; the text after it is still being
/// written.
pub fn split_remarks(transcript: &str) -> Vec<Remark<'_>> {
    let mut remarks = Vec::new();
    let mut rest = transcript;

    while !rest.is_empty() {
        let Some(start) = rest.find(INST_OPEN) else {
            remarks.push(Remark {
                user: false,
                content: rest,
            });
            break;
        };
        if start > 0 {
            remarks.push(Remark {
                user: false,
                content: &rest[..start],
            });
        }
        let inner = &rest[start + INST_OPEN.len()..];
        let Some(end) = inner.find(INST_CLOSE) else {
            break;
        };
        remarks.push(Remark {
            user: true,
            content: &inner[..end],
        });
        rest = &inner[end + INST_CLOSE.len()..];
    }
    remarks
}

/// A transcript is healthy unless an assistant remark says otherwise
pub fn is_healthy(transcript: &str) -> bool {
    !split_remarks(transcript)
        .iter()
        .any(|remark| !remark.user && remark.content.contains(UNHEALTHY))
}

/// The `$ command` an UNHEALTHY answer asks to run, if any
pub fn suggested_command(answer: &str) -> Option<String> {
    if !answer.contains(UNHEALTHY) {
        return None;
    }
    let start = answer.find("\n$ ")? + 3;
    let line = answer[start..].lines().next().unwrap_or_default().trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Runs one diagnostics conversation per tick
pub struct Diagnostician {
    inference: Arc<dyn Inference>,
    runner: Arc<dyn CommandRunner>,
    exec: bool,
    max_rounds: usize,
}

impl Diagnostician {
    pub fn new(
        inference: Arc<dyn Inference>,
        runner: Arc<dyn CommandRunner>,
        exec: bool,
        max_rounds: usize,
    ) -> Self {
        Self {
            inference,
            runner,
            exec,
            max_rounds,
        }
    }

    /// Hold one conversation, writing the transcript to `out`
    pub async fn tick<W>(&self, out: &mut W) -> Result<(), DiagnosticsError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let brief = self.runner.run("ip", &["-br", "addr", "show"]).await?;
        let mut prompt = format!(
            "{}{}\nthe following is the output of ip -br addr show: {}{}\n",
            INST_OPEN,
            DIAGNOSIS_PROMPT,
            String::from_utf8_lossy(&brief),
            INST_CLOSE
        );
        out.write_all(prompt.as_bytes()).await?;

        for round in 1..=self.max_rounds {
            let mut tokens = self.inference.complete(&prompt).await?;
            let mut answer = String::new();
            while let Some(token) = tokens.next().await {
                let token = token?;
                out.write_all(token.as_bytes()).await?;
                answer.push_str(&token);
            }
            prompt.push_str(&answer);

            let Some(command) = suggested_command(&answer) else {
                break;
            };
            if !self.exec {
                info!("Diagnostics suggested '{}' (execution disabled)", command);
                break;
            }
            if round == self.max_rounds {
                debug!("Diagnostics round limit reached");
                break;
            }

            info!("Running suggested command: {}", command);
            let output = match self.runner.run("/bin/sh", &["-c", &command]).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("Suggested command failed: {}", e);
                    break;
                }
            };
            let feedback = format!(
                "{}'{}':\n\n```\n{}\n```\n{}",
                INST_OPEN,
                command,
                String::from_utf8_lossy(&output),
                INST_CLOSE
            );
            out.write_all(feedback.as_bytes()).await?;
            prompt.push_str(&feedback);
        }

        out.flush().await?;
        Ok(())
    }
}

enum Request {
    Register {
        time: i64,
        muxer: Arc<Muxer>,
    },
    Finished {
        time: i64,
        healthy: bool,
    },
    List {
        reply: oneshot::Sender<BTreeMap<i64, bool>>,
    },
    Get {
        time: i64,
        reply: oneshot::Sender<Option<Arc<Muxer>>>,
    },
}

struct Transcript {
    muxer: Arc<Muxer>,
    healthy: Option<bool>,
}

/// Handle to the task owning diagnostics transcripts
#[derive(Clone)]
pub struct HealthRegistry {
    requests: mpsc::Sender<Request>,
}

impl HealthRegistry {
    /// Start the registry, keeping at most `history` transcripts. The task
    /// exits when the last handle is dropped.
    pub fn spawn(history: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut transcripts: BTreeMap<i64, Transcript> = BTreeMap::new();
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Register { time, muxer } => {
                        transcripts.insert(
                            time,
                            Transcript {
                                muxer,
                                healthy: None,
                            },
                        );
                        while transcripts.len() > history {
                            transcripts.pop_first();
                        }
                    }
                    Request::Finished { time, healthy } => {
                        if let Some(transcript) = transcripts.get_mut(&time) {
                            transcript.healthy = Some(healthy);
                        }
                    }
                    Request::List { reply } => {
                        let map = transcripts
                            .iter()
                            .map(|(time, t)| (*time, t.healthy.unwrap_or(false)))
                            .collect();
                        let _ = reply.send(map);
                    }
                    Request::Get { time, reply } => {
                        let _ = reply.send(transcripts.get(&time).map(|t| t.muxer.clone()));
                    }
                }
            }
            debug!("Health registry stopped");
        });
        Self { requests: tx }
    }

    async fn send(&self, request: Request) -> Result<(), DiagnosticsError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| DiagnosticsError::Closed)
    }

    pub async fn register(&self, time: i64, muxer: Arc<Muxer>) -> Result<(), DiagnosticsError> {
        self.send(Request::Register { time, muxer }).await
    }

    pub async fn finished(&self, time: i64, healthy: bool) -> Result<(), DiagnosticsError> {
        self.send(Request::Finished { time, healthy }).await
    }

    /// Verdict per transcript; unfinished transcripts report `false`
    pub async fn list(&self) -> Result<BTreeMap<i64, bool>, DiagnosticsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::List { reply }).await?;
        rx.await.map_err(|_| DiagnosticsError::Closed)
    }

    pub async fn get(&self, time: i64) -> Result<Option<Arc<Muxer>>, DiagnosticsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Get { time, reply }).await?;
        rx.await.map_err(|_| DiagnosticsError::Closed)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Start one transcript: register its muxer and attach the drain reader that
/// records the verdict. Returns the pipe's write end and the sender through
/// which the tick reports whether it completed.
async fn start_transcript(
    registry: &HealthRegistry,
    time: i64,
) -> Result<(tokio::io::DuplexStream, oneshot::Sender<bool>), DiagnosticsError> {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let muxer = Muxer::new(reader);
    registry.register(time, muxer.clone()).await?;

    let (completed_tx, completed_rx) = oneshot::channel();
    let registry = registry.clone();
    let mut drain = muxer.reader();
    tokio::spawn(async move {
        let mut transcript = Vec::new();
        let read = drain.read_to_end(&mut transcript).await;
        // a tick that never reported back counts as failed
        let completed = completed_rx.await.unwrap_or(false);
        let healthy = match read {
            Ok(_) => completed && is_healthy(&String::from_utf8_lossy(&transcript)),
            Err(e) => {
                warn!("Transcript {} ended with error: {}", time, e);
                false
            }
        };
        debug!("Transcript {} finished (healthy: {})", time, healthy);
        let _ = registry.finished(time, healthy).await;
    });
    Ok((writer, completed_tx))
}

/// Run diagnostics every `interval` until shutdown
pub fn spawn_loop(
    diagnostician: Arc<Diagnostician>,
    registry: HealthRegistry,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let time = unix_now();
            debug!("Diagnostics tick {}", time);
            let (mut writer, completed) = match start_transcript(&registry, time).await {
                Ok(started) => started,
                Err(e) => {
                    warn!("Cannot start transcript: {}", e);
                    break;
                }
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                result = diagnostician.tick(&mut writer) => {
                    if let Err(e) = &result {
                        warn!("Diagnostics tick failed: {}", e);
                    }
                    let _ = completed.send(result.is_ok());
                }
            }
            // EOF for every reader
            let _ = writer.shutdown().await;
        }
        info!("Diagnostics loop stopped");
    })
}
