//! Ordered rule table for the log classifier.
//!
//! Each rule is `(name, state guard, pattern, action)`. Priority is the order
//! of `RuleTable::default_rules`; reorder there, not in the actions.

use std::sync::LazyLock;

use regex::{Captures, Regex, RegexSet};
use tracing::debug;

use super::{ClassifierConfig, EventKind, HostTarget, ParserState, ResultEvent, SessionState};
use crate::ansi::ColorHint;
use crate::reassembler::LogLine;

const POOL_PATTERN: &str = r"(?i)ConnectionPool\(host='(?P<host>[^']+)'";
const RESOLUTION_PATTERN: &str = r"(?i)failed to resolve\s+'?(?P<host>[a-z0-9][\w.-]*)'?|(?:nameresolutionerror|getaddrinfo failed).*?host='(?P<host2>[^']+)'";
const UPLOADER_LOG_PATTERN: &str =
    r"(?i)^(?:warning|error|critical):(?P<comp>[\w.]*uploader[\w.]*):\s*(?P<msg>.*)$";

/// Network failures read like exceptions but belong to their own rules.
static NETWORK_FAILURE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([POOL_PATTERN, RESOLUTION_PATTERN, UPLOADER_LOG_PATTERN])
        .expect("network failure patterns are valid")
});

/// Whether a rule consumed the line or lets later rules see it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Consumed,
    Continue,
}

/// Parser states in which a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    Any,
    AwaitingContinuation,
    /// Awaiting, and the line is not claimed by a result rule unless indented.
    AwaitingArtifact,
}

impl Guard {
    pub(crate) fn admits(self, state: &ParserState) -> bool {
        match self {
            Guard::Any => true,
            Guard::AwaitingContinuation | Guard::AwaitingArtifact => {
                matches!(state, ParserState::AwaitingContinuation { .. })
            }
        }
    }
}

type RuleAction = fn(
    &mut SessionState,
    &ClassifierConfig,
    &LogLine,
    &Captures,
    &mut Vec<ResultEvent>,
) -> Outcome;

pub(crate) struct Rule {
    pub(crate) name: &'static str,
    pub(crate) guard: Guard,
    pub(crate) pattern: Regex,
    pub(crate) action: RuleAction,
    /// Lines matching this rule are results in their own right.
    claims_result: bool,
}

pub(crate) struct RuleTable {
    rules: Vec<Rule>,
    results: RegexSet,
}

fn rule(name: &'static str, guard: Guard, pattern: &str, action: RuleAction) -> Rule {
    Rule {
        name,
        guard,
        pattern: Regex::new(pattern).unwrap(),
        action,
        claims_result: false,
    }
}

fn result_rule(name: &'static str, pattern: &str, action: RuleAction) -> Rule {
    Rule {
        claims_result: true,
        ..rule(name, Guard::Any, pattern, action)
    }
}

impl RuleTable {
    pub(crate) fn default_rules() -> Self {
        use Guard::{Any, AwaitingArtifact, AwaitingContinuation};
        Self::new(vec![
            rule(
                "continuation-artifact",
                AwaitingArtifact,
                r"(?i)(?P<artifact>[^\s/\\'\x22]+\.json)\b",
                complete_continuation,
            ),
            rule("continuation-abandon", AwaitingContinuation, r"^", abandon_continuation),
            rule(
                "flush",
                Any,
                r"(?i)^(?:test run (?:finished|completed?)|all tests (?:done|finished|completed)|summary\b)",
                flush_errors,
            ),
            result_rule(
                "buffered-error",
                r"\b[A-Za-z_][\w.]*(?:Exception\b|Error:)",
                buffer_error,
            ),
            result_rule(
                "task-progress",
                r"(?i)^running task:?\s+(?P<name>.+?)(?:\s*\((?P<extra>\d{1,3}(?:\.\d+)?\s*%|\d+(?:\.\d+)?\s*m?s)\))?$",
                task_progress,
            ),
            result_rule(
                "report-created",
                r"(?i)^(?:created|generated)\s+report:?\s+(?P<path>.+)$",
                report_created,
            ),
            result_rule(
                "canonical-result",
                r"^(?P<kind>PASS|FAIL|ERROR)\s+(?P<msg>.+)$",
                canonical_result,
            ),
            result_rule(
                "uploader",
                r"^<Uploader:(?P<name>[^>]+)>\s*(?P<msg>.*)$",
                uploader_line,
            ),
            result_rule("connection-pool", POOL_PATTERN, pool_failure),
            result_rule("name-resolution", RESOLUTION_PATTERN, resolution_failure),
            result_rule("uploader-log", UPLOADER_LOG_PATTERN, uploader_log_failure),
        ])
    }

    fn new(rules: Vec<Rule>) -> Self {
        let results = RegexSet::new(
            rules
                .iter()
                .filter(|r| r.claims_result)
                .map(|r| r.pattern.as_str()),
        )
        .unwrap();
        Self { rules, results }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Whether `rule` is evaluated for `line` while the parser is in `state`.
    pub(crate) fn admits(&self, rule: &Rule, state: &ParserState, line: &LogLine) -> bool {
        if !rule.guard.admits(state) {
            return false;
        }
        match rule.guard {
            // An unindented result line interrupts the continuation instead
            // of completing it.
            Guard::AwaitingArtifact => line.indented || !self.results.is_match(&line.text),
            Guard::Any | Guard::AwaitingContinuation => true,
        }
    }
}

fn complete_continuation(
    state: &mut SessionState,
    _config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let ParserState::AwaitingContinuation { target, pending } = std::mem::take(&mut state.parser)
    else {
        return Outcome::Continue;
    };
    let artifact = &caps["artifact"];
    events.push(ResultEvent {
        amends_previous: true,
        ..ResultEvent::grouped(EventKind::Pass, format!("{pending}, {artifact}"), target)
    });
    Outcome::Consumed
}

fn abandon_continuation(
    state: &mut SessionState,
    _config: &ClassifierConfig,
    line: &LogLine,
    _caps: &Captures,
    _events: &mut Vec<ResultEvent>,
) -> Outcome {
    if !line.indented {
        debug!(line = %line.text, "continuation abandoned");
        state.parser = ParserState::Standard;
    }
    Outcome::Continue
}

fn flush_errors(
    state: &mut SessionState,
    config: &ClassifierConfig,
    _line: &LogLine,
    _caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    if state.dropped_errors > 0 {
        debug!(dropped = state.dropped_errors, "errors beyond the cap were dropped");
        state.dropped_errors = 0;
    }
    events.extend(
        state
            .buffered_errors
            .drain(..)
            .map(|err| ResultEvent::grouped(EventKind::Error, err, config.error_group.as_str())),
    );
    Outcome::Continue
}

fn buffer_error(
    state: &mut SessionState,
    config: &ClassifierConfig,
    line: &LogLine,
    _caps: &Captures,
    _events: &mut Vec<ResultEvent>,
) -> Outcome {
    if NETWORK_FAILURE.is_match(&line.text) {
        return Outcome::Continue;
    }
    if state.buffered_errors.len() < config.max_buffered_errors {
        state.buffered_errors.push(line.text.clone());
    } else {
        state.dropped_errors += 1;
    }
    Outcome::Consumed
}

fn task_progress(
    _state: &mut SessionState,
    _config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let name = caps["name"].trim();
    let message = match caps.name("extra") {
        Some(extra) => format!("Running {name} ({})", extra.as_str()),
        None => format!("Running {name}"),
    };
    events.push(ResultEvent::progress(message));
    Outcome::Consumed
}

fn report_created(
    _state: &mut SessionState,
    _config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let path = caps["path"].trim();
    events.push(ResultEvent::new(
        EventKind::Pass,
        format!("Report created: {path}"),
    ));
    events.push(ResultEvent::progress("Uploading report..."));
    Outcome::Consumed
}

fn canonical_result(
    _state: &mut SessionState,
    _config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let kind = match &caps["kind"] {
        "PASS" => EventKind::Pass,
        "FAIL" => EventKind::Fail,
        _ => EventKind::Error,
    };
    events.push(ResultEvent::new(kind, caps["msg"].trim()));
    Outcome::Consumed
}

/// Status an uploader line reports on its own, before sticky failure applies.
fn uploader_status(hint: Option<ColorHint>, message: &str) -> EventKind {
    match hint {
        Some(ColorHint::Red) => return EventKind::Fail,
        Some(ColorHint::Green) => return EventKind::Pass,
        Some(ColorHint::Yellow) | None => {}
    }
    let lower = message.to_lowercase();
    if lower.contains("fail") {
        EventKind::Fail
    } else if ["success", "succeeded", "uploaded", "complete"]
        .iter()
        .any(|word| lower.contains(word))
    {
        EventKind::Pass
    } else {
        EventKind::Progress
    }
}

fn uploader_line(
    state: &mut SessionState,
    _config: &ClassifierConfig,
    line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let target = caps["name"].trim().to_string();
    let message = caps["msg"].trim().to_string();

    match uploader_status(line.hint, &message) {
        EventKind::Fail => {
            state.mark_failed(&target);
            state.clear_continuation_for(&target);
            events.push(ResultEvent::grouped(EventKind::Fail, message, target));
        }
        EventKind::Pass if state.has_failed(&target) => {
            debug!(target = %target, "success reported after failure, keeping failed");
            events.push(ResultEvent::grouped(EventKind::Fail, message, target));
        }
        EventKind::Pass => {
            if !message.to_lowercase().contains(".json") {
                state.parser = ParserState::AwaitingContinuation {
                    target: target.clone(),
                    pending: message.clone(),
                };
            }
            events.push(ResultEvent::grouped(EventKind::Pass, message, target));
        }
        kind => events.push(ResultEvent::grouped(kind, message, target)),
    }
    Outcome::Consumed
}

/// Resolve a host or component name through the host table. Unknown names
/// are reported under themselves.
fn target_for(hosts: &[HostTarget], raw: &str) -> String {
    let lower = raw.to_lowercase();
    hosts
        .iter()
        .find(|h| !h.needle.is_empty() && lower.contains(&h.needle.to_lowercase()))
        .map(|h| h.target.clone())
        .unwrap_or_else(|| raw.to_string())
}

fn network_failure(state: &mut SessionState, target: String, message: String) -> ResultEvent {
    state.mark_failed(&target);
    state.clear_continuation_for(&target);
    ResultEvent::grouped(EventKind::Fail, message, target)
}

fn pool_failure(
    state: &mut SessionState,
    config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let host = &caps["host"];
    let target = target_for(&config.hosts, host);
    let message = format!("{target}: connection to {host} failed");
    events.push(network_failure(state, target, message));
    Outcome::Consumed
}

fn resolution_failure(
    state: &mut SessionState,
    config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let Some(host) = caps.name("host").or_else(|| caps.name("host2")) else {
        return Outcome::Continue;
    };
    let host = host.as_str();
    let target = target_for(&config.hosts, host);
    let message = format!("{target}: could not resolve {host}");
    events.push(network_failure(state, target, message));
    Outcome::Consumed
}

fn uploader_log_failure(
    state: &mut SessionState,
    config: &ClassifierConfig,
    _line: &LogLine,
    caps: &Captures,
    events: &mut Vec<ResultEvent>,
) -> Outcome {
    let target = target_for(&config.hosts, &caps["comp"]);
    let message = format!("{target}: {}", caps["msg"].trim());
    events.push(network_failure(state, target, message));
    Outcome::Consumed
}
