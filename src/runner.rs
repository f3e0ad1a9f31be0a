//! Session runner — wires the orchestrator to the log pipeline.
//!
//! One consumer thread per session drains the output channel, republishes
//! raw chunks for live display, runs the reassembler and classifier, and
//! acknowledges pause prompts through the orchestrator. Everything a UI
//! needs arrives on a single ordered `RunEvent` channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::classifier::ResultEvent;
use crate::error::Result;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, Started};
use crate::pipeline::{LogPipeline, PipelineConfig, PipelineOutput};
use crate::session::ExitReport;

/// How often the consumer checks for exit while output is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Output still arriving after exit is drained for at most this long.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Everything a session reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started { pid: Option<u32> },
    /// Raw output, escape sequences included, for a terminal-style view.
    Raw(String),
    Result(ResultEvent),
    Status(String),
    /// Final event of a session. `None` when the exit status was lost.
    Exited(Option<ExitReport>),
}

pub struct Runner {
    orchestrator: Orchestrator,
    pipeline: PipelineConfig,
}

impl Runner {
    pub fn new(orchestrator: OrchestratorConfig, pipeline: PipelineConfig) -> Self {
        Self {
            orchestrator: Orchestrator::new(orchestrator),
            pipeline,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Start a session. Fails without side effects if one is already running.
    pub fn start(&self, command_line: &str) -> Result<Receiver<RunEvent>> {
        let started = self.orchestrator.start(command_line)?;
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(RunEvent::Started { pid: started.pid });

        let pipeline = LogPipeline::new(self.pipeline.clone());
        let orchestrator = self.orchestrator.clone();
        thread::Builder::new()
            .name("ptywatch-consumer".to_string())
            .spawn(move || consume(started, pipeline, orchestrator, tx))
            .map_err(|e| {
                self.orchestrator.kill();
                e
            })?;
        Ok(rx)
    }

    pub fn send_input(&self, text: &str) -> Result<()> {
        self.orchestrator.send_input(text)
    }

    pub fn kill(&self) {
        self.orchestrator.kill();
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default(), PipelineConfig::default())
    }
}

fn consume(
    started: Started,
    mut pipeline: LogPipeline,
    orchestrator: Orchestrator,
    tx: Sender<RunEvent>,
) {
    let Started { output, exited, .. } = started;
    let mut exit: Option<ExitReport> = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        match output.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => {
                let _ = tx.send(RunEvent::Raw(chunk.clone()));
                for item in pipeline.push(&chunk) {
                    match item {
                        PipelineOutput::Event(event) => {
                            let _ = tx.send(RunEvent::Result(event));
                        }
                        PipelineOutput::Status(text) => {
                            let _ = tx.send(RunEvent::Status(text));
                        }
                        PipelineOutput::SendInput(text) => {
                            if let Err(e) = orchestrator.send_input(&text) {
                                warn!(error = %e, "failed to acknowledge pause prompt");
                            }
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if exit.is_none() {
                    if let Ok(report) = exited.try_recv() {
                        exit = Some(report);
                        drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
                    }
                }
                // Some pseudo-consoles only close the output pipe once the
                // console itself is released.
                if drain_deadline.is_some_and(|d| Instant::now() >= d) {
                    debug!("output still open after exit, releasing session");
                    orchestrator.dispose();
                    drain_deadline = None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if exit.is_none() {
        exit = exited
            .recv_timeout(orchestrator.config().kill_timeout)
            .ok();
    }
    orchestrator.dispose();
    let _ = tx.send(RunEvent::Exited(exit));
}
