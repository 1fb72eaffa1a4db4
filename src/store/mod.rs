//! Persistence for finalized build reports.

use crate::errors::{AppError, AppResult};
use crate::models::{BuildReport, PhaseName};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Receives each finalized report exactly once. Callers treat a failed save
/// as a logged warning and never retry.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn save(&self, report: &BuildReport) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub run_id: String,
    pub prompt: String,
    pub theme_name: String,
    pub created_at: DateTime<Utc>,
    pub install_status: Option<String>,
    pub dev_status: Option<String>,
    pub render_status: Option<String>,
    pub error_total: u64,
}

#[derive(Debug)]
pub struct ReportStore {
    conn: Mutex<Connection>,
}

impl ReportStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("report store mutex poisoned".to_string()))
    }

    /// Inserts the report. A second save for the same run id is rejected.
    pub fn save_report(&self, report: &BuildReport) -> AppResult<()> {
        let report_json = serde_json::to_string(report)?;
        let status = |name: PhaseName| report.phases.get(name).map(|phase| phase.status.as_str());

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO build_reports (
               run_id, prompt, theme_name, created_at, install_status, dev_status, render_status, error_total, report_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.run_id,
                report.prompt,
                report.theme_name,
                report.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                status(PhaseName::Install),
                status(PhaseName::Dev),
                status(PhaseName::Render),
                report.errors.console.total as i64,
                report_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_report(&self, run_id: &str) -> AppResult<Option<BuildReport>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT report_json FROM build_reports WHERE run_id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Most recent first.
    pub fn list_reports(&self, limit: u32) -> AppResult<Vec<ReportSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, prompt, theme_name, created_at, install_status, dev_status, render_status, error_total
             FROM build_reports ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(ReportSummary {
                    run_id: row.get(0)?,
                    prompt: row.get(1)?,
                    theme_name: row.get(2)?,
                    created_at: parse_time(&row.get::<_, String>(3)?)?,
                    install_status: row.get(4)?,
                    dev_status: row.get(5)?,
                    render_status: row.get(6)?,
                    error_total: row.get::<_, i64>(7)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Keeps the newest `keep` reports and returns how many were deleted.
    pub fn prune(&self, keep: u32) -> AppResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM build_reports WHERE run_id NOT IN (
               SELECT run_id FROM build_reports ORDER BY created_at DESC LIMIT ?1
             )",
            [keep],
        )?;
        Ok(deleted)
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error)))
}

#[async_trait]
impl ReportSink for ReportStore {
    async fn save(&self, report: &BuildReport) -> AppResult<()> {
        self.save_report(report)
    }
}

#[cfg(test)]
mod tests {
    use super::ReportStore;
    use crate::models::{ErrorSource, PhaseName, PhaseOutcome, PhaseStatus};
    use crate::report::BuildReportCollector;
    use chrono::{Duration, Utc};

    fn report(run_id: &str, minutes_ago: i64) -> crate::models::BuildReport {
        let mut collector = BuildReportCollector::new(run_id, "todo app", "teal");
        collector.phase_start(PhaseName::Install);
        collector.phase_end(PhaseName::Install, PhaseOutcome::new(PhaseStatus::Fail).with_exit_code(1));
        collector.add_console_error("npm ERR! code ETIMEDOUT", ErrorSource::Install);
        let mut report = collector.finalize();
        report.timestamp = Utc::now() - Duration::minutes(minutes_ago);
        report
    }

    #[test]
    fn saves_and_reads_back_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::open(&dir.path().join("reports.db")).expect("store");
        let original = report("run-1", 0);
        store.save_report(&original).expect("save");

        let loaded = store.get_report("run-1").expect("get").expect("present");
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.errors.console.total, 1);
        assert!(store.get_report("missing").expect("get").is_none());

        let summaries = store.list_reports(10).expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].install_status.as_deref(), Some("fail"));
        assert!(summaries[0].dev_status.is_none());
    }

    #[test]
    fn duplicate_run_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::open(&dir.path().join("reports.db")).expect("store");
        store.save_report(&report("run-1", 0)).expect("save");
        let error = store.save_report(&report("run-1", 0)).expect_err("duplicate");
        assert!(error.to_string().starts_with("STORAGE"));
    }

    #[test]
    fn prune_keeps_newest_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ReportStore::open(&dir.path().join("nested/reports.db")).expect("store");
        for (index, minutes_ago) in [30, 20, 10].into_iter().enumerate() {
            store.save_report(&report(&format!("run-{}", index), minutes_ago)).expect("save");
        }
        assert_eq!(store.prune(2).expect("prune"), 1);
        let remaining: Vec<String> = store
            .list_reports(10)
            .expect("list")
            .into_iter()
            .map(|summary| summary.run_id)
            .collect();
        assert_eq!(remaining, vec!["run-2".to_string(), "run-1".to_string()]);
    }
}
