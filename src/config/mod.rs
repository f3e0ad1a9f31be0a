use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{ClassifierConfig, DEFAULT_ERROR_GROUP, HostTarget, default_hosts};
use crate::orchestrator::OrchestratorConfig;
use crate::pipeline::{DEFAULT_CONTINUE_INPUT, PipelineConfig};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".ptywatch";

fn default_columns() -> u16 {
    120
}

fn default_rows() -> u16 {
    30
}

fn default_read_chunk_bytes() -> usize {
    OrchestratorConfig::default_read_chunk_bytes()
}

fn default_output_channel_capacity() -> usize {
    256
}

fn default_kill_timeout_millis() -> u64 {
    3000
}

fn default_capacity_bytes() -> usize {
    crate::reassembler::DEFAULT_CAPACITY
}

fn default_pause_patterns() -> Vec<String> {
    crate::prompt::DEFAULT_PAUSE_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_continue_input() -> String {
    DEFAULT_CONTINUE_INPUT.to_string()
}

fn default_max_buffered_errors() -> usize {
    crate::classifier::DEFAULT_MAX_BUFFERED_ERRORS
}

fn default_error_group() -> String {
    DEFAULT_ERROR_GROUP.to_string()
}

/// Pseudo-terminal geometry and output loop settings.
///
/// ```toml
/// [terminal]
/// columns = 160
/// rows = 40
/// kill_timeout_millis = 5000
/// ```
#[derive(Debug, Deserialize, Serialize)]
pub struct TerminalSettings {
    #[serde(default = "default_columns")]
    pub columns: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
    #[serde(default = "default_output_channel_capacity")]
    pub output_channel_capacity: usize,
    #[serde(default = "default_kill_timeout_millis")]
    pub kill_timeout_millis: u64,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            columns: default_columns(),
            rows: default_rows(),
            read_chunk_bytes: default_read_chunk_bytes(),
            output_channel_capacity: default_output_channel_capacity(),
            kill_timeout_millis: default_kill_timeout_millis(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReassemblerSettings {
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    #[serde(default = "default_pause_patterns")]
    pub pause_patterns: Vec<String>,
    #[serde(default = "default_continue_input")]
    pub continue_input: String,
}

impl Default for ReassemblerSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            pause_patterns: default_pause_patterns(),
            continue_input: default_continue_input(),
        }
    }
}

/// Classifier section. `hosts` replaces the built-in table when present.
///
/// ```toml
/// [[classifier.hosts]]
/// needle = "files.example.org"
/// target = "NextCloud"
/// ```
#[derive(Debug, Deserialize, Serialize)]
pub struct ClassifierSettings {
    #[serde(default = "default_max_buffered_errors")]
    pub max_buffered_errors: usize,
    #[serde(default = "default_error_group")]
    pub error_group: String,
    #[serde(default = "default_hosts")]
    pub hosts: Vec<HostTarget>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            max_buffered_errors: default_max_buffered_errors(),
            error_group: default_error_group(),
            hosts: default_hosts(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct DisplaySettings {
    /// JSON pattern map used to group messages for display.
    #[serde(default)]
    pub group_map: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub terminal: TerminalSettings,
    #[serde(default)]
    pub reassembler: ReassemblerSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub display: DisplaySettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.ptywatch/config.toml` file and load
    /// it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            columns: self.terminal.columns,
            rows: self.terminal.rows,
            read_chunk_bytes: self.terminal.read_chunk_bytes,
            output_channel_capacity: self.terminal.output_channel_capacity,
            kill_timeout: Duration::from_millis(self.terminal.kill_timeout_millis),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_capacity: self.reassembler.capacity_bytes,
            pause_patterns: self.reassembler.pause_patterns.clone(),
            continue_input: self.reassembler.continue_input.clone(),
            classifier: ClassifierConfig {
                max_buffered_errors: self.classifier.max_buffered_errors,
                error_group: self.classifier.error_group.clone(),
                hosts: self.classifier.hosts.clone(),
            },
        }
    }
}
