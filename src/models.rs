use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Flat `path -> contents` mapping produced by the generation backend.
pub type FileMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Install,
    Dev,
    Render,
}

impl PhaseName {
    pub const ALL: [PhaseName; 3] = [PhaseName::Install, PhaseName::Dev, PhaseName::Render];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Dev => "dev",
            Self::Render => "render",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Running,
    Success,
    Fail,
    Timeout,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Which detection path concluded the render phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderSignal {
    AppRendered,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<RenderSignal>,
    #[serde(skip)]
    pub(crate) started: Option<Instant>,
}

impl PhaseRecord {
    pub(crate) fn running() -> Self {
        Self {
            status: PhaseStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            exit_code: None,
            log_tail: None,
            url: None,
            port: None,
            signal: None,
            started: Some(Instant::now()),
        }
    }
}

/// Terminal outcome handed to `BuildReportCollector::phase_end`.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub status: PhaseStatus,
    pub exit_code: Option<i32>,
    pub log_tail: Option<String>,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub signal: Option<RenderSignal>,
}

impl PhaseOutcome {
    pub fn new(status: PhaseStatus) -> Self {
        Self {
            status,
            exit_code: None,
            log_tail: None,
            url: None,
            port: None,
            signal: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_log_tail(mut self, log_tail: impl Into<String>) -> Self {
        self.log_tail = Some(log_tail.into());
        self
    }

    pub fn with_server(mut self, url: impl Into<String>, port: u16) -> Self {
        self.url = Some(url.into());
        self.port = Some(port);
        self
    }

    pub fn with_signal(mut self, signal: RenderSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phases {
    pub install: Option<PhaseRecord>,
    pub dev: Option<PhaseRecord>,
    pub render: Option<PhaseRecord>,
}

impl Phases {
    pub fn get(&self, name: PhaseName) -> Option<&PhaseRecord> {
        match name {
            PhaseName::Install => self.install.as_ref(),
            PhaseName::Dev => self.dev.as_ref(),
            PhaseName::Render => self.render.as_ref(),
        }
    }

    pub(crate) fn slot(&mut self, name: PhaseName) -> &mut Option<PhaseRecord> {
        match name {
            PhaseName::Install => &mut self.install,
            PhaseName::Dev => &mut self.dev,
            PhaseName::Render => &mut self.render,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepsRecord {
    pub approved: BTreeMap<String, String>,
    pub injected: Vec<String>,
    pub inject_error: Option<String>,
}

/// Partial update shallow-merged into `DepsRecord`.
#[derive(Debug, Clone, Default)]
pub struct DepsUpdate {
    pub approved: Option<BTreeMap<String, String>>,
    pub injected: Option<Vec<String>>,
    pub inject_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Install,
    Dependency,
    Export,
    Build,
    Runtime,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "INSTALL",
            Self::Dependency => "DEPENDENCY",
            Self::Export => "EXPORT",
            Self::Build => "BUILD",
            Self::Runtime => "RUNTIME",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ClassifiedCounts {
    pub install: u64,
    pub dependency: u64,
    pub build: u64,
    pub export: u64,
    pub runtime: u64,
}

impl ClassifiedCounts {
    pub fn increment(&mut self, category: ErrorCategory) {
        let slot = match category {
            ErrorCategory::Install => &mut self.install,
            ErrorCategory::Dependency => &mut self.dependency,
            ErrorCategory::Export => &mut self.export,
            ErrorCategory::Build => &mut self.build,
            ErrorCategory::Runtime => &mut self.runtime,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn get(&self, category: ErrorCategory) -> u64 {
        match category {
            ErrorCategory::Install => self.install,
            ErrorCategory::Dependency => self.dependency,
            ErrorCategory::Export => self.export,
            ErrorCategory::Build => self.build,
            ErrorCategory::Runtime => self.runtime,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleErrors {
    pub total: u64,
    pub unique_count: u64,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorsReport {
    pub console: ConsoleErrors,
    pub classified: ClassifiedCounts,
}

/// Where an aggregated error line was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    Install,
    Dev,
    Preview,
    Parent,
}

impl ErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Dev => "dev",
            Self::Preview => "preview",
            Self::Parent => "parent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub theme_name: String,
    pub telemetry: Option<serde_json::Value>,
    pub l0: Option<serde_json::Value>,
    pub quality_gates: Option<serde_json::Value>,
    pub phases: Phases,
    pub deps: DepsRecord,
    pub errors: ErrorsReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    Boot,
    Mount,
    Install,
    Dev,
    Render,
}

impl StepId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Mount => "mount",
            Self::Install => "install",
            Self::Dev => "dev",
            Self::Render => "render",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewState {
    Idle,
    Booting,
    Mounting,
    InjectingDeps,
    Installing,
    StartingDev,
    AwaitingRender,
    Done,
    Failed,
}

impl PreviewState {
    /// UI step driven by this state, if any.
    pub fn step(self) -> Option<StepId> {
        match self {
            Self::Booting => Some(StepId::Boot),
            Self::Mounting => Some(StepId::Mount),
            Self::Installing => Some(StepId::Install),
            Self::StartingDev => Some(StepId::Dev),
            Self::AwaitingRender => Some(StepId::Render),
            Self::Idle | Self::InjectingDeps | Self::Done | Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Progress notifications for the consuming UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreviewEvent {
    State {
        run_id: String,
        state: PreviewState,
    },
    Step {
        run_id: String,
        step: StepId,
        status: StepStatus,
    },
    Ready {
        run_id: String,
        url: String,
        port: u16,
    },
    Failed {
        run_id: String,
        notice: crate::classifier::FailureNotice,
    },
    Finalized {
        run_id: String,
    },
}

/// Input for one preview attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub files: FileMap,
    pub prompt: String,
    pub theme_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunDisposition {
    Done,
    Failed,
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOutcome {
    pub run_id: String,
    pub disposition: RunDisposition,
    pub preview_url: Option<String>,
    pub failure: Option<crate::classifier::FailureNotice>,
    pub report: Option<BuildReport>,
}
