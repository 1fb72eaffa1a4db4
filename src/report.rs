//! Per-run accumulator behind the finalized build report.
//!
//! The collector is a plain mutable value owned by the task driving a run.
//! It does not guard `finalize`; the orchestrator owns the at-most-once
//! contract.

use crate::classifier;
use crate::models::{
    BuildReport, DepsRecord, DepsUpdate, ErrorSource, ErrorsReport, PhaseName, PhaseOutcome, PhaseRecord, PhaseStatus,
    Phases,
};
use chrono::Utc;
use std::collections::HashSet;
use tokio::time::Instant;

pub const MAX_LOG_TAIL_CHARS: usize = 5_000;
pub const MAX_ERROR_SAMPLES: usize = 20;
pub const MAX_SAMPLE_CHARS: usize = 500;

/// djb2 over the message characters; collisions only merge telemetry samples.
pub fn message_hash(text: &str) -> u32 {
    text.chars()
        .fold(5381_u32, |hash, ch| (hash << 5).wrapping_add(hash).wrapping_add(ch as u32))
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((index, _)) => &text[index..],
        None => "",
    }
}

fn head_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone)]
pub struct BuildReportCollector {
    run_id: String,
    prompt: String,
    theme_name: String,
    telemetry: Option<serde_json::Value>,
    l0: Option<serde_json::Value>,
    quality_gates: Option<serde_json::Value>,
    phases: Phases,
    deps: DepsRecord,
    errors: ErrorsReport,
    seen: HashSet<u32>,
}

impl BuildReportCollector {
    pub fn new(run_id: impl Into<String>, prompt: impl Into<String>, theme_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            prompt: prompt.into(),
            theme_name: theme_name.into(),
            telemetry: None,
            l0: None,
            quality_gates: None,
            phases: Phases::default(),
            deps: DepsRecord::default(),
            errors: ErrorsReport::default(),
            seen: HashSet::new(),
        }
    }

    pub fn set_telemetry(&mut self, value: serde_json::Value) {
        self.telemetry = Some(value);
    }

    pub fn set_l0(&mut self, value: serde_json::Value) {
        self.l0 = Some(value);
    }

    pub fn set_quality_gates(&mut self, value: serde_json::Value) {
        self.quality_gates = Some(value);
    }

    pub fn set_deps(&mut self, update: DepsUpdate) {
        if let Some(approved) = update.approved {
            self.deps.approved = approved;
        }
        if let Some(injected) = update.injected {
            self.deps.injected = injected;
        }
        if let Some(inject_error) = update.inject_error {
            self.deps.inject_error = Some(inject_error);
        }
    }

    /// Marks a phase running. A second call for the same phase restarts its clock.
    pub fn phase_start(&mut self, name: PhaseName) {
        *self.phases.slot(name) = Some(PhaseRecord::running());
    }

    /// Closes a running phase. Returns `false` when the phase was never
    /// started or has already been closed; the record is left untouched then.
    pub fn phase_end(&mut self, name: PhaseName, outcome: PhaseOutcome) -> bool {
        let Some(phase) = self.phases.slot(name).as_mut() else {
            tracing::debug!(run_id = %self.run_id, phase = name.as_str(), "phase end ignored: never started");
            return false;
        };
        if phase.status.is_terminal() {
            tracing::debug!(run_id = %self.run_id, phase = name.as_str(), "phase end ignored: already closed");
            return false;
        }

        let now = Instant::now();
        let started = phase.started.take().unwrap_or(now);
        phase.status = outcome.status;
        phase.ended_at = Some(Utc::now());
        phase.duration_ms = Some(now.saturating_duration_since(started).as_millis() as u64);
        if outcome.exit_code.is_some() {
            phase.exit_code = outcome.exit_code;
        }
        if let Some(log_tail) = outcome.log_tail.filter(|tail| !tail.is_empty()) {
            phase.log_tail = Some(tail_chars(&log_tail, MAX_LOG_TAIL_CHARS).to_string());
        }
        if outcome.url.is_some() {
            phase.url = outcome.url;
        }
        if outcome.port.is_some() {
            phase.port = outcome.port;
        }
        if outcome.signal.is_some() {
            phase.signal = outcome.signal;
        }
        true
    }

    pub fn phase_status(&self, name: PhaseName) -> Option<PhaseStatus> {
        self.phases.get(name).map(|phase| phase.status)
    }

    pub fn running_phases(&self) -> Vec<PhaseName> {
        PhaseName::ALL
            .into_iter()
            .filter(|name| self.phase_status(*name) == Some(PhaseStatus::Running))
            .collect()
    }

    pub fn add_console_error(&mut self, message: &str, source: ErrorSource) {
        let console = &mut self.errors.console;
        console.total = console.total.saturating_add(1);
        if self.seen.insert(message_hash(message)) {
            console.unique_count = console.unique_count.saturating_add(1);
            if console.samples.len() < MAX_ERROR_SAMPLES {
                console.samples.push(head_chars(message, MAX_SAMPLE_CHARS));
            }
        }
        let category = classifier::classify(message);
        self.errors.classified.increment(category);
        tracing::debug!(
            run_id = %self.run_id,
            source = source.as_str(),
            category = category.as_str(),
            "console error recorded"
        );
    }

    pub fn console_error_total(&self) -> u64 {
        self.errors.console.total
    }

    pub fn finalize(&self) -> BuildReport {
        BuildReport {
            run_id: self.run_id.clone(),
            timestamp: Utc::now(),
            prompt: self.prompt.clone(),
            theme_name: self.theme_name.clone(),
            telemetry: self.telemetry.clone(),
            l0: self.l0.clone(),
            quality_gates: self.quality_gates.clone(),
            phases: self.phases.clone(),
            deps: self.deps.clone(),
            errors: self.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{message_hash, tail_chars, BuildReportCollector, MAX_ERROR_SAMPLES, MAX_LOG_TAIL_CHARS};
    use crate::models::{DepsUpdate, ErrorSource, PhaseName, PhaseOutcome, PhaseStatus, RenderSignal};
    use std::collections::BTreeMap;
    use tokio::time::Duration;

    fn collector() -> BuildReportCollector {
        BuildReportCollector::new("run-1", "todo app", "teal")
    }

    #[test]
    fn duplicate_errors_count_once_as_unique() {
        let mut report = collector();
        for _ in 0..7 {
            report.add_console_error("TypeError: x is undefined", ErrorSource::Preview);
        }
        let finalized = report.finalize();
        assert_eq!(finalized.errors.console.total, 7);
        assert_eq!(finalized.errors.console.unique_count, 1);
        assert_eq!(finalized.errors.console.samples.len(), 1);
        assert_eq!(finalized.errors.classified.runtime, 7);
    }

    #[test]
    fn samples_are_capped() {
        let mut report = collector();
        for index in 0..25 {
            report.add_console_error(&format!("Uncaught error #{}", index), ErrorSource::Preview);
        }
        let finalized = report.finalize();
        assert_eq!(finalized.errors.console.samples.len(), MAX_ERROR_SAMPLES);
        assert_eq!(finalized.errors.console.unique_count, 25);
        assert_eq!(finalized.errors.console.total, 25);
    }

    #[test]
    fn long_samples_are_truncated() {
        let mut report = collector();
        report.add_console_error(&"x".repeat(2_000), ErrorSource::Dev);
        assert_eq!(report.finalize().errors.console.samples[0].chars().count(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn phase_duration_tracks_elapsed_time() {
        let mut report = collector();
        report.phase_start(PhaseName::Install);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(report.phase_end(PhaseName::Install, PhaseOutcome::new(PhaseStatus::Success).with_exit_code(0)));

        let finalized = report.finalize();
        let install = finalized.phases.install.expect("install phase");
        assert_eq!(install.status, PhaseStatus::Success);
        assert_eq!(install.duration_ms, Some(250));
        assert_eq!(install.exit_code, Some(0));
        assert!(install.ended_at.is_some());
    }

    #[test]
    fn phase_end_without_start_is_ignored() {
        let mut report = collector();
        assert!(!report.phase_end(PhaseName::Dev, PhaseOutcome::new(PhaseStatus::Fail)));
        assert!(report.finalize().phases.dev.is_none());
    }

    #[test]
    fn closed_phase_is_not_mutated_again() {
        let mut report = collector();
        report.phase_start(PhaseName::Render);
        assert!(report.phase_end(
            PhaseName::Render,
            PhaseOutcome::new(PhaseStatus::Success).with_signal(RenderSignal::AppRendered)
        ));
        assert!(!report.phase_end(
            PhaseName::Render,
            PhaseOutcome::new(PhaseStatus::Timeout).with_signal(RenderSignal::Timeout)
        ));
        let render = report.finalize().phases.render.expect("render phase");
        assert_eq!(render.status, PhaseStatus::Success);
        assert_eq!(render.signal, Some(RenderSignal::AppRendered));
    }

    #[test]
    fn log_tail_keeps_last_characters() {
        let mut report = collector();
        report.phase_start(PhaseName::Install);
        let output = format!("{}{}", "a".repeat(6_000), "END");
        report.phase_end(PhaseName::Install, PhaseOutcome::new(PhaseStatus::Fail).with_log_tail(output));
        let tail = report.finalize().phases.install.and_then(|phase| phase.log_tail).expect("tail");
        assert_eq!(tail.chars().count(), MAX_LOG_TAIL_CHARS);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn deps_update_is_shallow_merge() {
        let mut report = collector();
        let mut approved = BTreeMap::new();
        approved.insert("zustand".to_string(), "^4.5.0".to_string());
        report.set_deps(DepsUpdate {
            approved: Some(approved),
            ..DepsUpdate::default()
        });
        report.set_deps(DepsUpdate {
            injected: Some(vec!["zustand".to_string()]),
            ..DepsUpdate::default()
        });
        let deps = report.finalize().deps;
        assert_eq!(deps.approved.get("zustand").map(String::as_str), Some("^4.5.0"));
        assert_eq!(deps.injected, vec!["zustand".to_string()]);
        assert!(deps.inject_error.is_none());
    }

    #[test]
    fn finalized_report_serializes_without_dedup_state() {
        let mut report = collector();
        report.add_console_error("npm ERR! code E404", ErrorSource::Install);
        let json = serde_json::to_value(report.finalize()).expect("serialize");
        assert_eq!(json["errors"]["console"]["uniqueCount"], 1);
        assert_eq!(json["errors"]["classified"]["INSTALL"], 1);
        assert!(json["errors"]["console"].get("seen").is_none());
        assert!(json["phases"]["install"].is_null());
        assert!(json["telemetry"].is_null());
    }

    #[test]
    fn hash_and_tail_helpers() {
        assert_eq!(message_hash(""), 5381);
        assert_eq!(message_hash("a"), 5381 * 33 + 97);
        assert_eq!(tail_chars("héllo", 3), "llo");
        assert_eq!(tail_chars("hi", 10), "hi");
    }
}
