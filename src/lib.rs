pub mod classifier;
pub mod errors;
pub mod files;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod redaction;
pub mod report;
pub mod sandbox;
pub mod settings;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use classifier::{classify, describe_failure, FailureKind, FailureNotice, RecoveryAction};
pub use errors::{AppError, AppResult};
pub use models::{
    BuildReport, ErrorCategory, ErrorSource, FileMap, PhaseName, PhaseStatus, PreviewEvent, PreviewOutcome,
    PreviewRequest, PreviewState, RunDisposition,
};
pub use orchestrator::{PreviewInbox, PreviewMessage, PreviewOrchestrator};
pub use report::BuildReportCollector;
pub use sandbox::{LocalBooter, SandboxBooter, SandboxHost, SandboxProcess, ServerReady, SessionManager};
pub use settings::PreviewSettings;
pub use store::{ReportSink, ReportStore, ReportSummary};
