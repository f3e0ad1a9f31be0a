//! Stateful log classifier.
//!
//! Turns cleaned output lines into typed result events. Rules live in an
//! ordered table (see [`rules`]) evaluated top to bottom; the first rule that
//! consumes a line stops evaluation. Some rules only adjust state and let the
//! line fall through.
//!
//! ## State machine
//!
//! ```text
//! STANDARD                 → uploader success without .json  → AWAITING(target)
//! AWAITING(target)         → line with .json artifact        → amend event, STANDARD
//!                            (unless an unindented result line)
//! AWAITING(target)         → unindented unrelated line       → STANDARD, line falls through
//! AWAITING(target)         → network failure for target      → STANDARD
//! ```
//!
//! Alongside the state the classifier keeps a bounded list of deferred
//! exception lines (flushed once at the flush marker) and the set of targets
//! that have failed for good.

mod rules;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::reassembler::LogLine;
use rules::{Outcome, RuleTable};

pub const DEFAULT_MAX_BUFFERED_ERRORS: usize = 100;
pub const DEFAULT_ERROR_GROUP: &str = "Render errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Pass,
    Fail,
    Error,
    /// Status-bar text only; never becomes a result row.
    Progress,
}

/// A classified result, emitted in source line order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEvent {
    pub kind: EventKind,
    pub message: String,
    pub group_key: Option<String>,
    /// Set when this event completes the previous event for the same group
    /// (continuation lines) so a grid can update that row in place.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub amends_previous: bool,
}

impl ResultEvent {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            group_key: None,
            amends_previous: false,
        }
    }

    pub fn grouped(kind: EventKind, message: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            group_key: Some(group.into()),
            ..Self::new(kind, message)
        }
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(EventKind::Progress, message)
    }
}

/// Parser mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParserState {
    #[default]
    Standard,
    /// The previous uploader line for `target` succeeded without naming its
    /// final artifact; `pending` is that line's message.
    AwaitingContinuation { target: String, pending: String },
}

/// Maps a raw hostname or component name to a logical target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostTarget {
    /// Case-insensitive substring of the host or component.
    pub needle: String,
    pub target: String,
}

impl HostTarget {
    pub fn new(needle: &str, target: &str) -> Self {
        Self {
            needle: needle.to_string(),
            target: target.to_string(),
        }
    }
}

/// Built-in host table used when the config does not provide one.
pub fn default_hosts() -> Vec<HostTarget> {
    vec![
        HostTarget::new("nextcloud", "NextCloud"),
        HostTarget::new("dropbox", "Dropbox"),
        HostTarget::new("github", "GitHub"),
        HostTarget::new("gitlab", "GitLab"),
        HostTarget::new("slack", "Slack"),
        HostTarget::new("discord", "Discord"),
    ]
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub max_buffered_errors: usize,
    pub error_group: String,
    pub hosts: Vec<HostTarget>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_buffered_errors: DEFAULT_MAX_BUFFERED_ERRORS,
            error_group: DEFAULT_ERROR_GROUP.to_string(),
            hosts: default_hosts(),
        }
    }
}

/// Mutable per-session state that rule actions operate on.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) parser: ParserState,
    pub(crate) buffered_errors: Vec<String>,
    pub(crate) dropped_errors: usize,
    pub(crate) failed_targets: HashSet<String>,
}

impl SessionState {
    pub(crate) fn mark_failed(&mut self, target: &str) {
        self.failed_targets.insert(target.to_lowercase());
    }

    pub(crate) fn has_failed(&self, target: &str) -> bool {
        self.failed_targets.contains(&target.to_lowercase())
    }

    /// Leave continuation mode if it is waiting on `target`.
    pub(crate) fn clear_continuation_for(&mut self, target: &str) {
        if let ParserState::AwaitingContinuation { target: waiting, .. } = &self.parser {
            if waiting.eq_ignore_ascii_case(target) {
                self.parser = ParserState::Standard;
            }
        }
    }
}

pub struct LogClassifier {
    rules: RuleTable,
    config: ClassifierConfig,
    state: SessionState,
}

impl LogClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            rules: RuleTable::default_rules(),
            config,
            state: SessionState::default(),
        }
    }

    /// Classify one line. Never fails; unrecognised lines yield no events.
    pub fn classify(&mut self, line: &LogLine) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        for rule in self.rules.iter() {
            if !self.rules.admits(rule, &self.state.parser, line) {
                continue;
            }
            let Some(caps) = rule.pattern.captures(&line.text) else {
                continue;
            };
            let outcome = (rule.action)(&mut self.state, &self.config, line, &caps, &mut events);
            if outcome == Outcome::Consumed {
                debug!(rule = rule.name, events = events.len(), "line classified");
                break;
            }
        }
        events
    }

    pub fn state(&self) -> &ParserState {
        &self.state.parser
    }

    /// Number of deferred errors waiting for the flush marker.
    pub fn buffered_errors(&self) -> usize {
        self.state.buffered_errors.len()
    }

    pub fn has_failed(&self, target: &str) -> bool {
        self.state.has_failed(target)
    }

    /// Rule names in evaluation order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Forget everything learned from the previous session.
    pub fn reset(&mut self) {
        self.state = SessionState::default();
    }
}

impl Default for LogClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::ColorHint;

    fn classify(c: &mut LogClassifier, text: &str) -> Vec<ResultEvent> {
        c.classify(&LogLine::plain(text))
    }

    #[test]
    fn canonical_pass_line() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "PASS widget check ok");
        assert_eq!(
            events,
            vec![ResultEvent::new(EventKind::Pass, "widget check ok")]
        );
    }

    #[test]
    fn canonical_fail_and_error_lines() {
        let mut c = LogClassifier::default();
        assert_eq!(classify(&mut c, "FAIL disk space")[0].kind, EventKind::Fail);
        assert_eq!(classify(&mut c, "ERROR no config")[0].kind, EventKind::Error);
    }

    #[test]
    fn unmatched_lines_are_ignored() {
        let mut c = LogClassifier::default();
        assert!(classify(&mut c, "Microsoft Windows [Version 10.0.19045]").is_empty());
        assert!(classify(&mut c, "pass lowercase is not canonical").is_empty());
        assert!(classify(&mut c, "PASS").is_empty());
    }

    #[test]
    fn task_line_emits_progress_only() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "Running task: render thumbnails (45%)");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Progress);
        assert_eq!(events[0].message, "Running render thumbnails (45%)");

        let events = classify(&mut c, "Running task compile (2.5s)");
        assert_eq!(events[0].message, "Running compile (2.5s)");
    }

    #[test]
    fn report_creation_emits_pass_then_upload_progress() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "Created report: out/report.html");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Pass);
        assert!(events[0].message.contains("out/report.html"));
        assert_eq!(events[1].kind, EventKind::Progress);
    }

    #[test]
    fn exceptions_wait_for_flush_marker() {
        let mut c = LogClassifier::default();
        assert!(classify(&mut c, "RenderException: frame 3 timed out").is_empty());
        assert!(classify(&mut c, "System.IO.IOException: disk busy").is_empty());
        assert_eq!(c.buffered_errors(), 2);

        let events = classify(&mut c, "Test run finished");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Error));
        assert!(
            events
                .iter()
                .all(|e| e.group_key.as_deref() == Some(DEFAULT_ERROR_GROUP))
        );
        assert_eq!(c.buffered_errors(), 0);

        // Flushed exactly once.
        assert!(classify(&mut c, "Test run finished").is_empty());
    }

    #[test]
    fn error_style_lines_are_buffered_too() {
        let mut c = LogClassifier::default();
        assert!(classify(&mut c, "ValueError: bad frame").is_empty());
        assert!(classify(&mut c, "renderer.TimeoutError: frame 9").is_empty());
        assert_eq!(c.buffered_errors(), 2);
        assert_eq!(classify(&mut c, "Summary").len(), 2);
    }

    #[test]
    fn network_errors_are_not_buffered() {
        let mut c = LogClassifier::default();
        let events = classify(
            &mut c,
            "urllib3.exceptions.NameResolutionError: Failed to resolve 'nextcloud.example.org'",
        );
        assert_eq!(c.buffered_errors(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Fail);
        assert_eq!(events[0].group_key.as_deref(), Some("NextCloud"));

        classify(
            &mut c,
            "requests.exceptions.ConnectionError: HTTPSConnectionPool(host='dropbox.com', port=443)",
        );
        assert_eq!(c.buffered_errors(), 0);
        assert!(c.has_failed("Dropbox"));
    }

    #[test]
    fn buffered_errors_are_capped() {
        let mut c = LogClassifier::default();
        for i in 0..150 {
            classify(&mut c, &format!("RenderException: frame {i} failed"));
        }
        assert_eq!(c.buffered_errors(), DEFAULT_MAX_BUFFERED_ERRORS);
        let events = classify(&mut c, "Summary");
        assert_eq!(events.len(), 100);
        // Oldest are kept.
        assert_eq!(events[0].message, "RenderException: frame 0 failed");
        assert_eq!(events[99].message, "RenderException: frame 99 failed");
    }

    #[test]
    fn flush_line_still_falls_through() {
        let mut c = LogClassifier::default();
        classify(&mut c, "RenderException: boom");
        let events = classify(&mut c, "Summary FAIL count 3");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
    }

    #[test]
    fn uploader_success_without_json_awaits_continuation() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Pass);
        assert_eq!(events[0].group_key.as_deref(), Some("NextCloud"));
        assert!(matches!(
            c.state(),
            ParserState::AwaitingContinuation { target, .. } if target == "NextCloud"
        ));

        let events = classify(&mut c, "    https://cloud.example.org/s/abc/report.json");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Pass);
        assert!(events[0].amends_previous);
        assert!(events[0].message.contains("report.json"));
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn uploader_success_with_json_stays_standard() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "<Uploader:Dropbox> success results.json");
        assert_eq!(events[0].kind, EventKind::Pass);
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn unrelated_line_abandons_continuation_and_is_classified() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        let events = classify(&mut c, "FAIL widget broke");
        assert_eq!(c.state(), &ParserState::Standard);
        assert_eq!(events, vec![ResultEvent::new(EventKind::Fail, "widget broke")]);
    }

    #[test]
    fn result_line_with_artifact_interrupts_continuation() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        let events = classify(&mut c, "FAIL schema check results.json");
        assert_eq!(
            events,
            vec![ResultEvent::new(EventKind::Fail, "schema check results.json")]
        );
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn other_uploader_with_artifact_interrupts_continuation() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        let events = classify(&mut c, "<Uploader:Dropbox> success results.json");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Pass);
        assert_eq!(events[0].group_key.as_deref(), Some("Dropbox"));
        assert!(!events[0].amends_previous);
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn plain_unindented_artifact_line_completes_continuation() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        let events = classify(&mut c, "Share link: https://cloud.example.org/s/x/report.json");
        assert_eq!(events.len(), 1);
        assert!(events[0].amends_previous);
        assert_eq!(events[0].group_key.as_deref(), Some("NextCloud"));
    }

    #[test]
    fn indented_line_keeps_waiting() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        assert!(classify(&mut c, "   please wait").is_empty());
        assert!(matches!(c.state(), ParserState::AwaitingContinuation { .. }));
    }

    #[test]
    fn uploader_status_from_colour_hint() {
        let mut c = LogClassifier::default();
        let line = LogLine::plain("<Uploader:Slack> posted").with_hint(ColorHint::Red);
        let events = c.classify(&line);
        assert_eq!(events[0].kind, EventKind::Fail);
        assert!(c.has_failed("slack"));

        let mut c = LogClassifier::default();
        let line = LogLine::plain("<Uploader:Slack> failed? no").with_hint(ColorHint::Green);
        assert_eq!(c.classify(&line)[0].kind, EventKind::Pass);
    }

    #[test]
    fn uploader_without_status_words_is_progress() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "<Uploader:NextCloud> connecting...");
        assert_eq!(events[0].kind, EventKind::Progress);
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn failure_is_sticky_for_a_target() {
        let mut c = LogClassifier::default();
        let events = classify(&mut c, "<Uploader:NextCloud> upload failed: 503");
        assert_eq!(events[0].kind, EventKind::Fail);

        for _ in 0..3 {
            let events = classify(&mut c, "<Uploader:NextCloud> success report.json");
            assert_eq!(events[0].kind, EventKind::Fail);
        }

        // Other targets are unaffected.
        let events = classify(&mut c, "<Uploader:Dropbox> success report.json");
        assert_eq!(events[0].kind, EventKind::Pass);
    }

    #[test]
    fn sticky_failure_short_circuits_continuation() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> upload failed");
        let events = classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        assert_eq!(events[0].kind, EventKind::Fail);
        assert_eq!(c.state(), &ParserState::Standard);
    }

    #[test]
    fn pool_error_maps_host_to_target() {
        let mut c = LogClassifier::default();
        let events = classify(
            &mut c,
            "HTTPSConnectionPool(host='nextcloud.example.org', port=443): Max retries exceeded",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Fail);
        assert_eq!(events[0].group_key.as_deref(), Some("NextCloud"));
        assert!(c.has_failed("NextCloud"));

        let later = classify(&mut c, "<Uploader:NextCloud> success report.json");
        assert_eq!(later[0].kind, EventKind::Fail);
    }

    #[test]
    fn dns_error_with_unknown_host_uses_host_name() {
        let mut c = LogClassifier::default();
        let events = classify(
            &mut c,
            "NameResolutionError: Failed to resolve 'files.internal.lan' ([Errno 11001] getaddrinfo failed)",
        );
        assert_eq!(events[0].kind, EventKind::Fail);
        assert_eq!(events[0].group_key.as_deref(), Some("files.internal.lan"));
    }

    #[test]
    fn uploader_log_warning_marks_target_failed_and_clears_continuation() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> uploaded report.html");
        let events = classify(&mut c, "WARNING:uploader.nextcloud:share link could not be created");
        assert_eq!(events[0].kind, EventKind::Fail);
        assert_eq!(events[0].group_key.as_deref(), Some("NextCloud"));
        assert_eq!(c.state(), &ParserState::Standard);
        assert!(c.has_failed("nextcloud"));
    }

    #[test]
    fn reset_clears_all_session_state() {
        let mut c = LogClassifier::default();
        classify(&mut c, "<Uploader:NextCloud> upload failed");
        classify(&mut c, "RenderException: x");
        classify(&mut c, "<Uploader:Dropbox> uploaded a.html");
        c.reset();
        assert_eq!(c.state(), &ParserState::Standard);
        assert_eq!(c.buffered_errors(), 0);
        assert!(!c.has_failed("NextCloud"));
    }

    #[test]
    fn rule_order_is_visible() {
        let c = LogClassifier::default();
        let names = c.rule_names();
        assert_eq!(names.first(), Some(&"continuation-artifact"));
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("flush") < pos("buffered-error"));
        assert!(pos("canonical-result") < pos("uploader"));
        assert!(pos("uploader") < pos("connection-pool"));
    }
}
