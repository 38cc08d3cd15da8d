//! The pluggable resolution seam. The engine only sees [`Solver`]; the
//! reference implementation shells out to pip's dry-run install report.

use std::{collections::BTreeMap, fs, path::PathBuf, process::Command};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;
use xe_domain::PackageRecord;

/// Resolve one top-level requirement against an interpreter version,
/// returning the flat list of concrete packages an install would need.
/// Implementations must not mutate shared state; the engine calls `resolve`
/// from several threads at once.
pub trait Solver: Send + Sync {
    fn resolve(&self, requirement: &str, python_version: &str) -> Result<Vec<PackageRecord>>;
}

/// Reference solver: `python -m pip install <req> --dry-run --report <file>`.
///
/// The report goes to a file, never stdout, so interpreter banners or warning
/// noise cannot corrupt the JSON.
pub struct PipReportSolver {
    python_exe: PathBuf,
}

impl PipReportSolver {
    pub fn new(python_exe: PathBuf) -> Self {
        Self { python_exe }
    }
}

impl Solver for PipReportSolver {
    fn resolve(&self, requirement: &str, python_version: &str) -> Result<Vec<PackageRecord>> {
        debug!(requirement, python_version, "resolving via pip report");
        let report_file = tempfile::Builder::new()
            .prefix("xe-report-")
            .suffix(".json")
            .tempfile()
            .context("failed to create report temp file")?;

        let output = Command::new(&self.python_exe)
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg(requirement)
            .arg("--dry-run")
            .arg("--quiet")
            .arg("--report")
            .arg(report_file.path())
            .output()
            .with_context(|| format!("failed to invoke pip for {requirement}"))?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pip resolution exited with {}: {}{}",
                output.status,
                stdout,
                stderr
            );
        }

        let report_data = fs::read(report_file.path())
            .with_context(|| format!("failed to read pip report for {requirement}"))?;
        let report: PipReport = serde_json::from_slice(&report_data)
            .with_context(|| format!("failed to parse pip report for {requirement}"))?;
        Ok(report.into_records())
    }
}

#[derive(Debug, Deserialize)]
struct PipReport {
    #[serde(default)]
    install: Vec<PipInstallItem>,
}

#[derive(Debug, Deserialize)]
struct PipInstallItem {
    metadata: PipMetadata,
    #[serde(default)]
    download_info: PipDownloadInfo,
}

#[derive(Debug, Deserialize)]
struct PipMetadata {
    name: String,
    version: String,
}

#[derive(Debug, Default, Deserialize)]
struct PipDownloadInfo {
    #[serde(default)]
    url: String,
    #[serde(default)]
    archive_info: PipArchiveInfo,
}

#[derive(Debug, Default, Deserialize)]
struct PipArchiveInfo {
    #[serde(default)]
    hashes: BTreeMap<String, String>,
}

impl PipReport {
    fn into_records(self) -> Vec<PackageRecord> {
        self.install
            .into_iter()
            .map(|item| PackageRecord {
                name: item.metadata.name,
                version: item.metadata.version,
                url: item.download_info.url,
                sha256: item.download_info.archive_info.hashes.get("sha256").cloned(),
            })
            .collect()
    }
}
