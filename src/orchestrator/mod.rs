//! Drives one preview run through boot, mount, dependency injection,
//! install, dev-server start and first render, producing exactly one
//! build report per run.

pub mod messages;
pub mod race;

use crate::classifier::{self, FailureNotice};
use crate::errors::{AppError, AppResult};
use crate::files::{self, manifest, preset, FileSystemTree, MANIFEST_PATH, META_PATH};
use crate::models::{
    BuildReport, DepsUpdate, ErrorSource, PhaseName, PhaseOutcome, PhaseStatus, PreviewEvent, PreviewOutcome,
    PreviewRequest, PreviewState, RenderSignal, RunDisposition, StepStatus,
};
use crate::output::{strip_terminal_codes, LineBuffer, OutputTail};
use crate::redaction;
use crate::report::{tail_chars, BuildReportCollector, MAX_LOG_TAIL_CHARS};
use crate::sandbox::{SandboxHost, ServerReady, SessionManager};
use crate::settings::PreviewSettings;
use crate::store::ReportSink;
use race::{SignalFunnel, SignalKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

pub use messages::{PreviewInbox, PreviewMessage};

const EVENT_CAPACITY: usize = 256;
const INSTALL_FAILURE_TAIL_CHARS: usize = 500;
const NETWORK_INSTALL_FAILURE: &str = "Network connection failed: dependencies could not be downloaded. \
Check the connection and retry.\n\nIf the problem persists it may be:\n\
1. an unstable network connection\n\
2. an unreachable npm registry mirror\n\
3. a firewall or proxy blocking the connection";

pub struct PreviewOrchestrator {
    sessions: Arc<SessionManager>,
    settings: PreviewSettings,
    sink: Option<Arc<dyn ReportSink>>,
    inbox: PreviewInbox,
    events: broadcast::Sender<PreviewEvent>,
    active: watch::Sender<Option<String>>,
}

impl PreviewOrchestrator {
    pub fn new(sessions: Arc<SessionManager>, settings: PreviewSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (active, _) = watch::channel(None);
        Self {
            sessions,
            settings,
            sink: None,
            inbox: PreviewInbox::new(),
            events,
            active,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Where messages posted by the running preview are delivered.
    pub fn inbox(&self) -> PreviewInbox {
        self.inbox.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.events.subscribe()
    }

    pub fn active_run(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    /// Abandons the active run, if any. Its pending signals are dropped and
    /// its report is never finalized.
    pub fn cancel(&self) {
        if let Some(run_id) = self.active.send_replace(None) {
            tracing::info!(run_id = %run_id, "preview run cancelled");
        }
    }

    /// Runs one preview attempt to completion. Starting a run supersedes
    /// whichever run was active before.
    pub async fn run(&self, request: PreviewRequest) -> PreviewOutcome {
        let run_id = Uuid::new_v4().to_string();
        let mut active = self.active.subscribe();
        if let Some(previous) = self.active.send_replace(Some(run_id.clone())) {
            tracing::info!(run_id = %run_id, previous = %previous, "superseding active preview run");
        }
        active.borrow_and_update();

        tracing::info!(run_id = %run_id, files = request.files.len(), "preview run started");
        let mut ctx = RunContext::new(run_id.clone(), &request, self.events.clone(), self.sink.clone());
        let mut funnel = SignalFunnel::new(run_id.clone());
        funnel.forward_preview(self.inbox.subscribe());

        let result = tokio::select! {
            biased;
            _ = superseded(&mut active, &run_id) => None,
            result = self.drive(&mut ctx, &mut funnel, &request) => Some(result),
        };
        drop(funnel);

        let outcome = match result {
            None => {
                tracing::info!(run_id = %run_id, state = ?ctx.state, "preview run superseded");
                PreviewOutcome {
                    run_id: run_id.clone(),
                    disposition: RunDisposition::Superseded,
                    preview_url: None,
                    failure: None,
                    report: ctx.report.take(),
                }
            }
            Some(Ok(server)) => {
                tracing::info!(run_id = %run_id, url = %server.url, "preview run done");
                PreviewOutcome {
                    run_id: run_id.clone(),
                    disposition: RunDisposition::Done,
                    preview_url: Some(server.url),
                    failure: None,
                    report: ctx.report.take(),
                }
            }
            Some(Err(error)) => {
                let notice = ctx.fail(&error);
                PreviewOutcome {
                    run_id: run_id.clone(),
                    disposition: RunDisposition::Failed,
                    preview_url: None,
                    failure: Some(notice),
                    report: ctx.report.take(),
                }
            }
        };

        self.active.send_if_modified(|current| {
            if current.as_deref() == Some(run_id.as_str()) {
                *current = None;
                true
            } else {
                false
            }
        });
        outcome
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        funnel: &mut SignalFunnel,
        request: &PreviewRequest,
    ) -> AppResult<ServerReady> {
        ctx.enter(PreviewState::Booting);
        let host = self.acquire_session(&ctx.run_id).await?;

        ctx.enter(PreviewState::Mounting);
        self.mount(ctx, host.as_ref(), request).await?;

        ctx.enter(PreviewState::InjectingDeps);
        self.inject_approved_dependencies(ctx, host.as_ref()).await;

        ctx.enter(PreviewState::Installing);
        self.install(ctx, host.as_ref()).await?;

        ctx.enter(PreviewState::StartingDev);
        let server = self.start_dev(ctx, funnel, host.as_ref()).await?;
        ctx.emit(PreviewEvent::Ready {
            run_id: ctx.run_id.clone(),
            url: server.url.clone(),
            port: server.port,
        });

        ctx.enter(PreviewState::AwaitingRender);
        self.await_render(ctx, funnel).await;

        ctx.enter(PreviewState::Done);
        Ok(server)
    }

    async fn acquire_session(&self, run_id: &str) -> AppResult<Arc<dyn SandboxHost>> {
        match self.sessions.get_session().await {
            Ok(host) => Ok(host),
            Err(error) if is_out_of_memory(&error) => {
                tracing::warn!(run_id = %run_id, error = %error, "sandbox boot hit memory pressure; retrying once");
                self.sessions.teardown().await;
                tokio::time::sleep(self.settings.memory_retry_delay()).await;
                self.sessions.get_session().await.map_err(|retry| {
                    tracing::error!(run_id = %run_id, error = %retry, "sandbox boot failed after memory recovery");
                    AppError::OutOfMemory(format!(
                        "sandbox is out of memory after cleanup and retry; close other memory-heavy processes and try again ({})",
                        retry.detail()
                    ))
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn mount(&self, ctx: &mut RunContext, host: &dyn SandboxHost, request: &PreviewRequest) -> AppResult<()> {
        let mut merged = files::merge_with_preset(&request.files);
        merged.insert(preset::RUN_MARKER_PATH.to_string(), preset::run_marker(&ctx.run_id));
        let tree = FileSystemTree::from_files(&merged);

        host.mount(&tree).await.map_err(|error| match error {
            AppError::Mount(_) => error,
            other => AppError::Mount(other.detail().to_string()),
        })?;
        host.read_file(MANIFEST_PATH)
            .await
            .map_err(|error| AppError::Mount(format!("package.json missing after mount: {}", error.detail())))?;

        tracing::debug!(run_id = %ctx.run_id, files = tree.file_count(), "file tree mounted");
        Ok(())
    }

    /// Never fails the run; problems end up in `deps.injectError`.
    async fn inject_approved_dependencies(&self, ctx: &mut RunContext, host: &dyn SandboxHost) {
        let raw = match host.read_file(META_PATH).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::debug!(run_id = %ctx.run_id, error = %error, "no dependency metadata");
                ctx.collector.set_deps(DepsUpdate {
                    injected: Some(Vec::new()),
                    ..DepsUpdate::default()
                });
                return;
            }
        };

        match self.apply_metadata(ctx, host, &raw).await {
            Ok(injected) => {
                if !injected.is_empty() {
                    tracing::info!(run_id = %ctx.run_id, injected = ?injected, "approved dependencies injected");
                }
                ctx.collector.set_deps(DepsUpdate {
                    injected: Some(injected),
                    ..DepsUpdate::default()
                });
            }
            Err(error) => {
                tracing::warn!(run_id = %ctx.run_id, error = %error, "dependency injection failed; continuing without");
                ctx.collector.set_deps(DepsUpdate {
                    injected: Some(Vec::new()),
                    inject_error: Some(error.detail().to_string()),
                    ..DepsUpdate::default()
                });
            }
        }
    }

    async fn apply_metadata(&self, ctx: &mut RunContext, host: &dyn SandboxHost, raw: &str) -> AppResult<Vec<String>> {
        let meta: serde_json::Value = serde_json::from_str(raw)
            .map_err(|error| AppError::Internal(format!("vibe.meta.json is not valid JSON: {}", error)))?;

        if let Some(value) = meta.get("telemetry").filter(|value| !value.is_null()) {
            ctx.collector.set_telemetry(value.clone());
        }
        if let Some(value) = meta.get("l0").filter(|value| !value.is_null()) {
            ctx.collector.set_l0(value.clone());
        }
        if let Some(value) = meta.get("quality_gates").filter(|value| !value.is_null()) {
            ctx.collector.set_quality_gates(value.clone());
        }

        let approved: BTreeMap<String, String> = match meta.pointer("/dependencies/approved") {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())
                .map_err(|error| AppError::Internal(format!("dependencies.approved is malformed: {}", error)))?,
            _ => BTreeMap::new(),
        };
        ctx.collector.set_deps(DepsUpdate {
            approved: Some(approved.clone()),
            ..DepsUpdate::default()
        });
        if approved.is_empty() {
            return Ok(Vec::new());
        }

        let current = host.read_file(MANIFEST_PATH).await?;
        let injection = manifest::inject_dependencies(&current, &approved)?;
        if !injection.rejected.is_empty() {
            tracing::warn!(
                run_id = %ctx.run_id,
                rejected = ?injection.rejected,
                "approved dependencies outside the allow-list were dropped"
            );
        }
        if !injection.injected.is_empty() {
            host.write_file(MANIFEST_PATH, &injection.manifest).await?;
        }
        Ok(injection.injected)
    }

    async fn install(&self, ctx: &mut RunContext, host: &dyn SandboxHost) -> AppResult<()> {
        let (program, args) = split_command(&self.settings.install_command)?;
        ctx.collector.phase_start(PhaseName::Install);
        let mut process = host.spawn(program, args).await?;

        let mut lines = LineBuffer::new();
        let mut tail = OutputTail::new(MAX_LOG_TAIL_CHARS);
        let code = loop {
            tokio::select! {
                biased;
                chunk = process.output.recv() => match chunk {
                    Some(chunk) => ctx.absorb_install_output(&mut lines, &mut tail, &chunk),
                    None => break (&mut process.exit).await.unwrap_or(-1),
                },
                code = &mut process.exit => {
                    while let Ok(chunk) = process.output.try_recv() {
                        ctx.absorb_install_output(&mut lines, &mut tail, &chunk);
                    }
                    break code.unwrap_or(-1);
                }
            }
        };
        if let Some(rest) = lines.finish() {
            ctx.record_install_line(&rest);
        }

        if code == 0 {
            ctx.collector
                .phase_end(PhaseName::Install, PhaseOutcome::new(PhaseStatus::Success).with_exit_code(0));
            return Ok(());
        }

        let output = tail.as_str().to_string();
        tracing::warn!(run_id = %ctx.run_id, code, "dependency install failed");
        ctx.collector.phase_end(
            PhaseName::Install,
            PhaseOutcome::new(PhaseStatus::Fail)
                .with_exit_code(code)
                .with_log_tail(output.clone()),
        );
        ctx.finalize();

        let message = if classifier::is_network_failure(&output) {
            NETWORK_INSTALL_FAILURE.to_string()
        } else {
            format!(
                "npm install failed (exit code: {})\n\nOutput:\n{}",
                code,
                tail_chars(&output, INSTALL_FAILURE_TAIL_CHARS)
            )
        };
        Err(AppError::Install(message))
    }

    /// Races server-ready against the dev-server timeout and a non-zero exit.
    async fn start_dev(
        &self,
        ctx: &mut RunContext,
        funnel: &mut SignalFunnel,
        host: &dyn SandboxHost,
    ) -> AppResult<ServerReady> {
        let (program, args) = split_command(&self.settings.dev_command)?;
        ctx.collector.phase_start(PhaseName::Dev);
        let process = host.spawn(program, args).await?;
        funnel.forward_server_ready(process.ready);
        funnel.forward_dev_output(process.output);
        funnel.forward_dev_exit(process.exit);

        let timeout = self.settings.dev_server_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                signal = funnel.recv() => {
                    let Some(signal) = signal else {
                        return Err(AppError::Internal("run signal channel closed".to_string()));
                    };
                    if signal.run_id != ctx.run_id {
                        tracing::debug!(run_id = %ctx.run_id, stale = %signal.run_id, "ignoring signal from another run");
                        continue;
                    }
                    match signal.kind {
                        SignalKind::ServerReady(server) => {
                            tracing::info!(run_id = %ctx.run_id, url = %server.url, port = server.port, "dev server ready");
                            ctx.collector.phase_end(
                                PhaseName::Dev,
                                PhaseOutcome::new(PhaseStatus::Success).with_server(server.url.clone(), server.port),
                            );
                            return Ok(server);
                        }
                        SignalKind::DevExit(0) => {
                            tracing::debug!(run_id = %ctx.run_id, "dev process exited cleanly before server-ready");
                        }
                        SignalKind::DevExit(code) => {
                            tracing::warn!(run_id = %ctx.run_id, code, "dev process exited before server-ready");
                            let tail = ctx.dev_tail.as_str().to_string();
                            ctx.collector.phase_end(
                                PhaseName::Dev,
                                PhaseOutcome::new(PhaseStatus::Fail).with_exit_code(code).with_log_tail(tail),
                            );
                            ctx.finalize();
                            return Err(AppError::DevServer(format!(
                                "dev server exited with code {} before it was ready",
                                code
                            )));
                        }
                        SignalKind::DevOutput(chunk) => ctx.absorb_dev_output(&chunk),
                        SignalKind::Preview(message) => ctx.absorb_preview_message(message),
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(run_id = %ctx.run_id, timeout_ms = timeout.as_millis() as u64, "dev server timed out");
                    let tail = ctx.dev_tail.as_str().to_string();
                    ctx.collector.phase_end(
                        PhaseName::Dev,
                        PhaseOutcome::new(PhaseStatus::Timeout).with_log_tail(tail),
                    );
                    ctx.finalize();
                    return Err(AppError::DevServer(format!(
                        "dev server did not become ready within {}s",
                        timeout.as_secs()
                    )));
                }
            }
        }
    }

    /// Waits for the preview's first paint. Both outcomes finalize the report
    /// and leave the run successful.
    async fn await_render(&self, ctx: &mut RunContext, funnel: &mut SignalFunnel) {
        ctx.collector.phase_start(PhaseName::Render);
        let deadline = tokio::time::sleep(self.settings.render_timeout());
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                signal = funnel.recv() => {
                    let Some(signal) = signal else {
                        continue;
                    };
                    if signal.run_id != ctx.run_id {
                        tracing::debug!(run_id = %ctx.run_id, stale = %signal.run_id, "ignoring signal from another run");
                        continue;
                    }
                    match signal.kind {
                        SignalKind::Preview(PreviewMessage::AppRendered { .. }) => {
                            tracing::info!(run_id = %ctx.run_id, "preview rendered");
                            break PhaseOutcome::new(PhaseStatus::Success).with_signal(RenderSignal::AppRendered);
                        }
                        SignalKind::Preview(message) => ctx.absorb_preview_message(message),
                        SignalKind::DevOutput(chunk) => ctx.absorb_dev_output(&chunk),
                        SignalKind::DevExit(code) => {
                            tracing::warn!(run_id = %ctx.run_id, code, "dev process exited during render window");
                        }
                        SignalKind::ServerReady(_) => {}
                    }
                }
                _ = &mut deadline => {
                    let errors = ctx.collector.console_error_total();
                    let status = if errors > 0 { PhaseStatus::Fail } else { PhaseStatus::Timeout };
                    tracing::warn!(run_id = %ctx.run_id, errors, status = status.as_str(), "render signal timed out");
                    break PhaseOutcome::new(status).with_signal(RenderSignal::Timeout);
                }
            }
        };

        ctx.collector.phase_end(PhaseName::Render, outcome);
        ctx.finalize();
    }
}

/// Resolves once `run_id` is no longer the active run.
async fn superseded(active: &mut watch::Receiver<Option<String>>, run_id: &str) {
    loop {
        if active.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if active.borrow_and_update().as_deref() != Some(run_id) {
            return;
        }
    }
}

fn is_out_of_memory(error: &AppError) -> bool {
    matches!(error, AppError::OutOfMemory(_)) || classifier::is_memory_error(error.detail())
}

fn split_command(command: &[String]) -> AppResult<(&str, &[String])> {
    command
        .split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| AppError::Config("command cannot be empty".to_string()))
}

/// Mutable state of one run, owned by the task driving it.
struct RunContext {
    run_id: String,
    collector: BuildReportCollector,
    state: PreviewState,
    finalized: bool,
    report: Option<BuildReport>,
    dev_lines: LineBuffer,
    dev_tail: OutputTail,
    events: broadcast::Sender<PreviewEvent>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl RunContext {
    fn new(
        run_id: String,
        request: &PreviewRequest,
        events: broadcast::Sender<PreviewEvent>,
        sink: Option<Arc<dyn ReportSink>>,
    ) -> Self {
        Self {
            collector: BuildReportCollector::new(run_id.clone(), request.prompt.clone(), request.theme_name.clone()),
            run_id,
            state: PreviewState::Idle,
            finalized: false,
            report: None,
            dev_lines: LineBuffer::new(),
            dev_tail: OutputTail::new(MAX_LOG_TAIL_CHARS),
            events,
            sink,
        }
    }

    fn emit(&self, event: PreviewEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_step(&self, state: PreviewState, status: StepStatus) {
        if let Some(step) = state.step() {
            self.emit(PreviewEvent::Step {
                run_id: self.run_id.clone(),
                step,
                status,
            });
        }
    }

    fn enter(&mut self, next: PreviewState) {
        if self.state.step().is_some() && self.state.step() != next.step() {
            self.emit_step(self.state, StepStatus::Completed);
        }
        tracing::debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "preview state");
        self.state = next;
        self.emit(PreviewEvent::State {
            run_id: self.run_id.clone(),
            state: next,
        });
        self.emit_step(next, StepStatus::Running);
    }

    /// Produces the report once; later calls are no-ops.
    fn finalize(&mut self) -> bool {
        if self.finalized {
            tracing::debug!(run_id = %self.run_id, "report already finalized");
            return false;
        }
        self.finalized = true;

        let mut report = self.collector.finalize();
        let scrubbed = redaction::scrub_report(&mut report);
        if scrubbed > 0 {
            tracing::info!(run_id = %self.run_id, scrubbed, "scrubbed credentials from build report");
        }

        if let Some(sink) = self.sink.clone() {
            let report = report.clone();
            tokio::spawn(async move {
                if let Err(error) = sink.save(&report).await {
                    tracing::warn!(run_id = %report.run_id, error = %error, "failed to persist build report");
                }
            });
        }

        tracing::info!(
            run_id = %self.run_id,
            console_errors = report.errors.console.total,
            "build report finalized"
        );
        self.emit(PreviewEvent::Finalized {
            run_id: self.run_id.clone(),
        });
        self.report = Some(report);
        true
    }

    fn fail(&mut self, error: &AppError) -> FailureNotice {
        tracing::error!(run_id = %self.run_id, state = ?self.state, error = %error, "preview run failed");
        self.collector
            .add_console_error(&format!("[parent] {}", error), ErrorSource::Parent);
        for phase in self.collector.running_phases() {
            self.collector.phase_end(phase, PhaseOutcome::new(PhaseStatus::Fail));
        }
        self.finalize();

        self.emit_step(self.state, StepStatus::Failed);
        self.state = PreviewState::Failed;
        self.emit(PreviewEvent::State {
            run_id: self.run_id.clone(),
            state: PreviewState::Failed,
        });

        let mut notice = classifier::describe_failure(&error.to_string());
        notice.message = redaction::scrub(error.detail()).0;
        self.emit(PreviewEvent::Failed {
            run_id: self.run_id.clone(),
            notice: notice.clone(),
        });
        notice
    }

    fn record_install_line(&mut self, line: &str) {
        let line = strip_terminal_codes(line);
        if classifier::is_install_error(&line) {
            self.collector.add_console_error(&line, ErrorSource::Install);
        }
    }

    fn absorb_install_output(&mut self, lines: &mut LineBuffer, tail: &mut OutputTail, chunk: &str) {
        tail.push(&strip_terminal_codes(chunk));
        let complete = lines.push(chunk);
        self.note_trimmed("install", lines.take_dropped_bytes());
        for line in complete {
            self.record_install_line(&line);
        }
    }

    fn absorb_dev_output(&mut self, chunk: &str) {
        self.dev_tail.push(&strip_terminal_codes(chunk));
        let complete = self.dev_lines.push(chunk);
        let dropped = self.dev_lines.take_dropped_bytes();
        self.note_trimmed("dev", dropped);
        for line in complete {
            let line = strip_terminal_codes(&line);
            if classifier::is_dev_error(&line) {
                self.collector.add_console_error(&line, ErrorSource::Dev);
            }
        }
    }

    fn note_trimmed(&self, stream: &'static str, bytes: usize) {
        if bytes > 0 {
            tracing::warn!(run_id = %self.run_id, stream, bytes, "unterminated output line trimmed");
        }
    }

    fn absorb_preview_message(&mut self, message: PreviewMessage) {
        match message {
            PreviewMessage::ConsoleError { message, .. } => {
                self.collector.add_console_error(&message, ErrorSource::Preview);
            }
            PreviewMessage::AppRendered { .. } => {
                tracing::debug!(run_id = %self.run_id, "render signal before render window ignored");
            }
        }
    }
}
