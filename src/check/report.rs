//! Check reports (CSV / JSON export)

use super::{CheckMode, DiskCheck};
use crate::error::{Result, RustVtlError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Clean,
    Repaired,
    Drift,
    Failed,
}

impl DiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskStatus::Clean => "clean",
            DiskStatus::Repaired => "repaired",
            DiskStatus::Drift => "drift",
            DiskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskReport {
    pub bid: u32,
    pub status: DiskStatus,
    pub reclaimed: u64,
    pub restored: u64,
    pub multiple_refs: u64,
    pub out_of_range: u64,
    pub pages_checked: u32,
    pub pages_drifted: u32,
    pub pages_repaired: u32,
    pub free_before: u64,
    pub free_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub dry_run: bool,
    pub generated_at: DateTime<Utc>,
    pub disks: Vec<DiskReport>,
}

impl CheckReport {
    pub fn from_checks(mode: CheckMode, checks: &[DiskCheck]) -> Self {
        let disks = checks
            .iter()
            .map(|check| match &check.result {
                Ok(outcome) => DiskReport {
                    bid: check.bid,
                    status: if outcome.is_clean() {
                        DiskStatus::Clean
                    } else if mode == CheckMode::DryRun {
                        DiskStatus::Drift
                    } else {
                        DiskStatus::Repaired
                    },
                    reclaimed: outcome.reclaimed,
                    restored: outcome.restored,
                    multiple_refs: outcome.multiple_refs,
                    out_of_range: outcome.out_of_range,
                    pages_checked: outcome.pages_checked,
                    pages_drifted: outcome.pages_drifted,
                    pages_repaired: outcome.pages_repaired,
                    free_before: outcome.free_before,
                    free_after: outcome.free_after,
                    error: None,
                    checked_at: check.checked_at,
                },
                Err(e) => DiskReport {
                    bid: check.bid,
                    status: DiskStatus::Failed,
                    reclaimed: 0,
                    restored: 0,
                    multiple_refs: 0,
                    out_of_range: 0,
                    pages_checked: 0,
                    pages_drifted: 0,
                    pages_repaired: 0,
                    free_before: 0,
                    free_after: 0,
                    error: Some(e.to_string()),
                    checked_at: check.checked_at,
                },
            })
            .collect();

        Self {
            dry_run: mode == CheckMode::DryRun,
            generated_at: Utc::now(),
            disks,
        }
    }

    pub fn failures(&self) -> usize {
        self.disks
            .iter()
            .filter(|d| d.status == DiskStatus::Failed)
            .count()
    }

    /// (reclaimed, restored) summed over all disks
    pub fn totals(&self) -> (u64, u64) {
        self.disks
            .iter()
            .fold((0, 0), |(r, s), d| (r + d.reclaimed, s + d.restored))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| RustVtlError::parse(format!("Failed to serialize check report: {}", e)))
    }

    pub fn export_to_csv<P: AsRef<Path>>(&self, csv_path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(&csv_path).map_err(|e| {
            RustVtlError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Cannot create CSV file: {}", e),
            ))
        })?;

        let csv_err = |e: csv::Error| {
            RustVtlError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to write CSV record: {}", e),
            ))
        };

        writer
            .write_record([
                "bid",
                "status",
                "reclaimed",
                "restored",
                "multiple_refs",
                "out_of_range",
                "pages_checked",
                "pages_drifted",
                "pages_repaired",
                "free_before",
                "free_after",
                "error",
                "checked_at",
            ])
            .map_err(csv_err)?;

        for disk in &self.disks {
            writer
                .write_record([
                    disk.bid.to_string(),
                    disk.status.as_str().to_string(),
                    disk.reclaimed.to_string(),
                    disk.restored.to_string(),
                    disk.multiple_refs.to_string(),
                    disk.out_of_range.to_string(),
                    disk.pages_checked.to_string(),
                    disk.pages_drifted.to_string(),
                    disk.pages_repaired.to_string(),
                    disk.free_before.to_string(),
                    disk.free_after.to_string(),
                    disk.error.clone().unwrap_or_default(),
                    disk.checked_at.to_rfc3339(),
                ])
                .map_err(csv_err)?;
        }

        writer.flush()?;
        info!(
            "Check report exported to CSV: {:?} ({} disks)",
            csv_path.as_ref(),
            self.disks.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckError, CheckOutcome};
    use tempfile::TempDir;

    fn checks() -> Vec<DiskCheck> {
        vec![
            DiskCheck {
                bid: 1,
                result: Ok(CheckOutcome {
                    reclaimed: 2,
                    restored: 1,
                    pages_checked: 1,
                    pages_drifted: 1,
                    pages_repaired: 1,
                    ..CheckOutcome::default()
                }),
                checked_at: Utc::now(),
            },
            DiskCheck {
                bid: 2,
                result: Err(CheckError::MissingIndex { bid: 2, index_id: 5 }),
                checked_at: Utc::now(),
            },
            DiskCheck {
                bid: 3,
                result: Ok(CheckOutcome::default()),
                checked_at: Utc::now(),
            },
        ]
    }

    #[test]
    fn test_statuses_and_totals() {
        let report = CheckReport::from_checks(CheckMode::Repair, &checks());
        let statuses: Vec<_> = report.disks.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![DiskStatus::Repaired, DiskStatus::Failed, DiskStatus::Clean]
        );
        assert_eq!(report.failures(), 1);
        assert_eq!(report.totals(), (2, 1));

        let dry = CheckReport::from_checks(CheckMode::DryRun, &checks());
        assert_eq!(dry.disks[0].status, DiskStatus::Drift);
    }

    #[test]
    fn test_json_output() {
        let report = CheckReport::from_checks(CheckMode::Repair, &checks());
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["disks"][0]["status"], "repaired");
        assert_eq!(value["disks"][1]["status"], "failed");
        assert!(value["disks"][0].get("error").is_none());
        assert!(value["disks"][1]["error"]
            .as_str()
            .unwrap()
            .contains("index at id 5"));
    }

    #[test]
    fn test_csv_export() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        let report = CheckReport::from_checks(CheckMode::Repair, &checks());
        report.export_to_csv(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "1");
        assert_eq!(&rows[0][1], "repaired");
        assert_eq!(&rows[1][1], "failed");
        assert_eq!(&rows[2][2], "0");
    }
}
