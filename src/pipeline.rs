//! Reassembler + classifier, run together on one consumer thread.

use tracing::info;

use crate::classifier::{ClassifierConfig, LogClassifier, ResultEvent};
use crate::prompt::PausePatterns;
use crate::reassembler::{LineReassembler, Reassembled};

/// Input sent to dismiss a pause prompt when nothing else is configured.
pub const DEFAULT_CONTINUE_INPUT: &str = "\r";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    pub pause_patterns: Vec<String>,
    pub continue_input: String,
    pub classifier: ClassifierConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: crate::reassembler::DEFAULT_CAPACITY,
            pause_patterns: crate::prompt::DEFAULT_PAUSE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            continue_input: DEFAULT_CONTINUE_INPUT.to_string(),
            classifier: ClassifierConfig::default(),
        }
    }
}

/// What the pipeline wants done after a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    Event(ResultEvent),
    /// Status-bar text.
    Status(String),
    /// Text to write to the child's input (pause acknowledgement).
    SendInput(String),
}

pub struct LogPipeline {
    reassembler: LineReassembler,
    classifier: LogClassifier,
    continue_input: String,
}

impl LogPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            reassembler: LineReassembler::new(
                config.buffer_capacity,
                PausePatterns::new(&config.pause_patterns),
            ),
            classifier: LogClassifier::new(config.classifier),
            continue_input: config.continue_input,
        }
    }

    /// Feed one raw chunk. Outputs are in source order.
    pub fn push(&mut self, chunk: &str) -> Vec<PipelineOutput> {
        let mut out = Vec::new();
        for item in self.reassembler.push(chunk) {
            match item {
                Reassembled::Line(line) => {
                    out.extend(
                        self.classifier
                            .classify(&line)
                            .into_iter()
                            .map(PipelineOutput::Event),
                    );
                }
                Reassembled::Paused(pause) => {
                    info!(prompt = %pause.matched_text, "auto-continuing pause prompt");
                    out.push(PipelineOutput::Status(format!(
                        "Auto-continuing: {}",
                        pause.matched_text
                    )));
                    out.push(PipelineOutput::SendInput(self.continue_input.clone()));
                }
            }
        }
        out
    }

    pub fn classifier(&self) -> &LogClassifier {
        &self.classifier
    }

    /// Clear buffered output and classifier state for a new session.
    pub fn reset(&mut self) {
        self.reassembler.clear();
        self.classifier.reset();
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
