//! The install engine: resolve → plan → fetch → extract with bounded
//! parallelism, solution caching and cooperative cancellation.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use sha1::{Digest, Sha1};
use tracing::{debug, info};
use xe_domain::{
    dedupe_packages, normalize_package_identity, PackageRecord, ProjectManifest, SolveGraph,
};

use crate::{
    cancel::CancelToken,
    error::InstallError,
    runtime::RuntimeProvider,
    solver::Solver,
    store::{cas::Cas, wheel},
};

pub struct Installer {
    cas: Cas,
    solver: Arc<dyn Solver>,
    runtime: Option<Arc<dyn RuntimeProvider>>,
    require_hashes: bool,
}

impl Installer {
    pub fn new(global_cache_dir: &Path, solver: Arc<dyn Solver>) -> Result<Self> {
        Ok(Self {
            cas: Cas::open(global_cache_dir)?,
            solver,
            runtime: None,
            require_hashes: false,
        })
    }

    /// Attach a runtime provider consulted when the caller passes no target
    /// site-packages directory.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeProvider>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Refuse records without a sha256 digest instead of trusting the
    /// download. Off by default.
    #[must_use]
    pub fn require_hashes(mut self, require: bool) -> Self {
        self.require_hashes = require;
        self
    }

    pub fn cas(&self) -> &Cas {
        &self.cas
    }

    /// Resolve `requirements` against the manifest's interpreter version and
    /// materialize every package into the target site-packages.
    ///
    /// The returned records are the persisted solve graph: deduplicated and
    /// sorted, independent of completion order. A repeat call with unchanged
    /// inputs is a solution-cache hit followed by already-installed skips and
    /// performs no network traffic.
    pub fn install(
        &self,
        ctx: &CancelToken,
        manifest: &ProjectManifest,
        requirements: &[String],
        project_dir: &Path,
        site_packages: Option<&Path>,
    ) -> Result<Vec<PackageRecord>> {
        let reqs = normalize_requirements(requirements);
        if reqs.is_empty() {
            return Ok(Vec::new());
        }

        let cache_key = solve_key(&manifest.python_version, &reqs);
        let graph = match self.cas.load_solution(&cache_key)? {
            Some(graph) => {
                debug!(key = %cache_key, packages = graph.packages.len(), "solution cache hit");
                graph
            }
            None => {
                let solved = self.resolve_parallel(ctx, &manifest.python_version, &reqs)?;
                let graph = SolveGraph {
                    python_version: manifest.python_version.clone(),
                    requirements: reqs.clone(),
                    packages: dedupe_packages(solved),
                };
                self.cas.save_solution(&cache_key, &graph)?;
                debug!(key = %cache_key, packages = graph.packages.len(), "solution persisted");
                graph
            }
        };

        let mut plan = graph.packages.clone();
        plan.sort_by(|a, b| a.name.cmp(&b.name));

        let target = self.resolve_target(manifest, project_dir, site_packages);
        fs::create_dir_all(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;

        self.fetch_and_extract(ctx, &plan, &target)?;
        Ok(graph.packages)
    }

    /// One solver call per top-level requirement, merged under a mutex. All
    /// in-flight resolves run to completion before the first error is
    /// reported. Cancellation is observed before each solver dispatch and
    /// again when the stage joins; a cancelled stage fails with `Cancelled`.
    fn resolve_parallel(
        &self,
        ctx: &CancelToken,
        python_version: &str,
        reqs: &[String],
    ) -> Result<Vec<PackageRecord>> {
        debug!(requirements = reqs.len(), python_version, "resolving in parallel");
        let merged: Mutex<Vec<PackageRecord>> = Mutex::new(Vec::new());
        let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);

        let merged_ref = &merged;
        let first_err_ref = &first_err;
        thread::scope(|scope| {
            for req in reqs {
                if ctx.is_cancelled() {
                    break;
                }
                scope.spawn(move || match self.solver.resolve(req, python_version) {
                    Ok(packages) => {
                        let mut all = merged_ref.lock().unwrap_or_else(|p| p.into_inner());
                        all.extend(packages);
                    }
                    Err(err) => {
                        let mut slot = first_err_ref.lock().unwrap_or_else(|p| p.into_inner());
                        if slot.is_none() {
                            *slot = Some(err.context(InstallError::ResolveFailed {
                                requirement: req.clone(),
                            }));
                        }
                    }
                });
            }
        });

        if ctx.is_cancelled() {
            return Err(InstallError::Cancelled.into());
        }
        if let Some(err) = first_err.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(err);
        }
        Ok(merged.into_inner().unwrap_or_else(|p| p.into_inner()))
    }

    fn resolve_target(
        &self,
        manifest: &ProjectManifest,
        project_dir: &Path,
        site_packages: Option<&Path>,
    ) -> PathBuf {
        if let Some(dir) = site_packages {
            if !dir.as_os_str().is_empty() {
                return dir.to_path_buf();
            }
        }
        if let Some(runtime) = &self.runtime {
            if let Ok(site) = runtime.site_packages(&manifest.python_version) {
                return site;
            }
        }
        project_dir.join("xe").join("site-packages")
    }

    /// Fan the plan out to a bounded worker pool. Download parallelism is
    /// `max(2, 2×CPU)`; extraction is CPU-bound and additionally capped by a
    /// `min(4, max(1, CPU/2))` semaphore. Workers report failures on an
    /// unbounded channel and keep draining; the first error wins after all
    /// workers finish.
    fn fetch_and_extract(
        &self,
        ctx: &CancelToken,
        plan: &[PackageRecord],
        site_packages: &Path,
    ) -> Result<()> {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let workers = (cpus * 2).max(2);
        let extract_permits = (cpus / 2).clamp(1, 4);
        info!(
            packages = plan.len(),
            workers, extract_permits, "downloading and extracting"
        );

        let (job_tx, job_rx) = mpsc::sync_channel::<PackageRecord>(workers);
        let job_rx = Mutex::new(job_rx);
        let (err_tx, err_rx) = mpsc::channel::<anyhow::Error>();
        let extract_sem = Semaphore::new(extract_permits);

        let job_rx_ref = &job_rx;
        let extract_sem_ref = &extract_sem;
        thread::scope(|scope| {
            for _ in 0..workers {
                let err_tx = err_tx.clone();
                scope.spawn(move || loop {
                    let received = job_rx_ref
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .recv();
                    let Ok(pkg) = received else { break };
                    if let Err(err) =
                        self.process_package(ctx, &pkg, site_packages, extract_sem_ref)
                    {
                        let _ = err_tx.send(err);
                    }
                });
            }
            drop(err_tx);

            for pkg in plan {
                if ctx.is_cancelled() {
                    break;
                }
                if job_tx.send(pkg.clone()).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        if ctx.is_cancelled() {
            return Err(InstallError::Cancelled.into());
        }
        if let Some(err) = err_rx.try_iter().next() {
            if InstallError::is_cancelled(&err) {
                return Err(InstallError::Cancelled.into());
            }
            return Err(err);
        }
        Ok(())
    }

    fn process_package(
        &self,
        ctx: &CancelToken,
        pkg: &PackageRecord,
        site_packages: &Path,
        extract_sem: &Semaphore,
    ) -> Result<()> {
        if is_installed_in_site_packages(site_packages, &pkg.name, &pkg.version) {
            debug!(name = %pkg.name, version = %pkg.version, reason = "already_installed", "skipped");
            return Ok(());
        }
        if pkg.url.trim().is_empty() {
            debug!(name = %pkg.name, version = %pkg.version, reason = "missing_download_url", "skipped");
            return Ok(());
        }
        if self.require_hashes && pkg.sha256.is_none() {
            bail!(
                "refusing {}=={}: record carries no sha256 digest",
                pkg.name,
                pkg.version
            );
        }

        let blob = self
            .cas
            .store_blob_from_url(ctx, &pkg.url, pkg.sha256.as_deref())
            .with_context(|| format!("download {}", pkg.name))?;

        extract_sem.acquire(ctx)?;
        let extracted = wheel::extract_wheel(ctx, &blob, site_packages);
        extract_sem.release();
        extracted.with_context(|| format!("install {}", pkg.name))?;
        debug!(name = %pkg.name, version = %pkg.version, "installed");
        Ok(())
    }
}

/// Trim entries, drop empties and sort, producing the canonical requirement
/// list every downstream key and cache decision hangs off.
pub fn normalize_requirements(requirements: &[String]) -> Vec<String> {
    let mut out: Vec<String> = requirements
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    out.sort();
    out
}

/// SHA-1 over the interpreter version and the sorted requirement list, with
/// `|` separators. Equal `(version, requirements)` pairs always map to the
/// same solution slot.
pub fn solve_key(python_version: &str, reqs: &[String]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(python_version.as_bytes());
    hasher.update(b"|");
    for req in reqs {
        hasher.update(req.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}

/// A record counts as installed iff the target holds a matching
/// `<name>-<version>.dist-info` directory, comparing names with `-`/`.`
/// folded to `_` and versions exactly.
pub fn is_installed_in_site_packages(site_packages: &Path, name: &str, version: &str) -> bool {
    let target_name = normalize_package_identity(name);
    let target_version = version.trim();
    if target_name.is_empty() || target_version.is_empty() {
        return false;
    }
    let Ok(entries) = fs::read_dir(site_packages) else {
        return false;
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let entry_name = entry.file_name().to_string_lossy().to_string();
        if !entry_name.to_lowercase().ends_with(".dist-info") {
            continue;
        }
        let base = &entry_name[..entry_name.len() - ".dist-info".len()];
        let Some(sep) = base.rfind('-') else { continue };
        if sep == 0 || sep + 1 >= base.len() {
            continue;
        }
        let installed_name = normalize_package_identity(&base[..sep]);
        let installed_version = base[sep + 1..].trim();
        if installed_name == target_name && installed_version == target_version {
            return true;
        }
    }
    false
}

/// Extraction semaphore: a bounded channel pre-filled with one token per
/// permit. Release sends the token back and never blocks; acquire re-checks
/// the cancel token between timed receives so a cancelled worker does not
/// sit behind a busy extractor.
struct Semaphore {
    tx: mpsc::SyncSender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(permits);
        for _ in 0..permits {
            let _ = tx.send(());
        }
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn acquire(&self, ctx: &CancelToken) -> Result<()> {
        loop {
            if ctx.is_cancelled() {
                return Err(InstallError::Cancelled.into());
            }
            let received = self
                .rx
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .recv_timeout(Duration::from_millis(50));
            match received {
                Ok(()) => return Ok(()),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    bail!("extraction permit pool disconnected")
                }
            }
        }
    }

    fn release(&self) {
        let _ = self.tx.send(());
    }
}
