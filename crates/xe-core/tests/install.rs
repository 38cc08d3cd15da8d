//! End-to-end install scenarios against an in-process wheel server.

use std::{
    collections::BTreeMap,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tiny_http::{Method, Response, Server, StatusCode};
use xe_core::{CancelToken, InstallError, Installer, Solver};
use xe_domain::{PackageRecord, ProjectManifest, SolveGraph};

fn build_wheel(name: &str, version: &str) -> Vec<u8> {
    let mut cursor = io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        writer
            .start_file(format!("{name}/__init__.py"), options)
            .expect("start module");
        writer
            .write_all(format!("__version__ = \"{version}\"\n").as_bytes())
            .expect("write module");
        writer
            .start_file(format!("{name}-{version}.dist-info/METADATA"), options)
            .expect("start metadata");
        writer
            .write_all(format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n").as_bytes())
            .expect("write metadata");
        writer.finish().expect("finish wheel");
    }
    cursor.into_inner()
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct Route {
    body: Vec<u8>,
    /// Responses for this path park until the gate opens. Lets a test freeze
    /// one download while others complete.
    gated: bool,
}

/// In-process wheel server. Every GET is recorded so tests can assert the
/// zero-traffic properties.
struct WheelServer {
    base: String,
    requests: Arc<Mutex<Vec<String>>>,
    gate_open: Arc<AtomicBool>,
    gate_hit: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WheelServer {
    fn start(routes: BTreeMap<String, Route>) -> Self {
        let server = Server::http("127.0.0.1:0").expect("http server");
        let base = format!("http://{}", server.server_addr());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let gate_open = Arc::new(AtomicBool::new(true));
        let gate_hit = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let routes = Arc::new(routes);
        let requests_srv = Arc::clone(&requests);
        let gate_open_srv = Arc::clone(&gate_open);
        let gate_hit_srv = Arc::clone(&gate_hit);
        let stop_srv = Arc::clone(&stop);
        let handle = thread::spawn(move || loop {
            if stop_srv.load(Ordering::SeqCst) {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(_) => break,
            };
            let routes = Arc::clone(&routes);
            let requests = Arc::clone(&requests_srv);
            let gate_open = Arc::clone(&gate_open_srv);
            let gate_hit = Arc::clone(&gate_hit_srv);
            let stop = Arc::clone(&stop_srv);
            thread::spawn(move || {
                let path = request.url().to_string();
                if request.method() != &Method::Get {
                    let _ = request.respond(Response::empty(StatusCode(405)));
                    return;
                }
                requests.lock().expect("request log").push(path.clone());
                match routes.get(&path) {
                    Some(route) => {
                        if route.gated {
                            gate_hit.store(true, Ordering::SeqCst);
                            while !gate_open.load(Ordering::SeqCst)
                                && !stop.load(Ordering::SeqCst)
                            {
                                thread::sleep(Duration::from_millis(5));
                            }
                        }
                        let _ = request.respond(Response::from_data(route.body.clone()));
                    }
                    None => {
                        let _ = request.respond(Response::empty(StatusCode(404)));
                    }
                }
            });
        });

        Self {
            base,
            requests,
            gate_open,
            gate_hit,
            stop,
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn gets_for(&self, path: &str) -> usize {
        self.requests
            .lock()
            .expect("request log")
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    fn total_gets(&self) -> usize {
        self.requests.lock().expect("request log").len()
    }

    fn close_gate(&self) {
        self.gate_open.store(false, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        self.gate_open.store(true, Ordering::SeqCst);
    }

    fn gate_was_hit(&self) -> bool {
        self.gate_hit.load(Ordering::SeqCst)
    }
}

impl Drop for WheelServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.gate_open.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Solver scripted per requirement, counting invocations.
struct StaticSolver {
    records: BTreeMap<String, Vec<PackageRecord>>,
    calls: Arc<AtomicUsize>,
}

impl StaticSolver {
    fn new(records: BTreeMap<String, Vec<PackageRecord>>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                records,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

impl Solver for StaticSolver {
    fn resolve(&self, requirement: &str, _python_version: &str) -> Result<Vec<PackageRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.records
            .get(requirement)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no release satisfies `{requirement}`"))
    }
}

struct Fixture {
    temp: tempfile::TempDir,
    server: WheelServer,
    wheel_a: Vec<u8>,
    wheel_b: Vec<u8>,
}

impl Fixture {
    /// Serves `a-1.0` and `b-2.1` faithfully and returns wrong bytes for
    /// `c-0.9`.
    fn new() -> Self {
        let wheel_a = build_wheel("a", "1.0");
        let wheel_b = build_wheel("b", "2.1");
        let mut routes = BTreeMap::new();
        routes.insert(
            "/a-1.0-py3-none-any.whl".to_string(),
            Route {
                body: wheel_a.clone(),
                gated: false,
            },
        );
        routes.insert(
            "/b-2.1-py3-none-any.whl".to_string(),
            Route {
                body: wheel_b.clone(),
                gated: true,
            },
        );
        routes.insert(
            "/c-0.9-py3-none-any.whl".to_string(),
            Route {
                body: b"these are not the bytes the digest promised".to_vec(),
                gated: false,
            },
        );
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
            server: WheelServer::start(routes),
            wheel_a,
            wheel_b,
        }
    }

    fn cache_dir(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    fn site_dir(&self, label: &str) -> PathBuf {
        self.temp.path().join(format!("site-{label}"))
    }

    fn manifest(&self) -> ProjectManifest {
        ProjectManifest::new_default(self.temp.path(), &self.cache_dir())
    }

    fn record(&self, name: &str, version: &str, wheel: &[u8]) -> PackageRecord {
        PackageRecord {
            name: name.to_string(),
            version: version.to_string(),
            url: self.server.url(&format!("/{name}-{version}-py3-none-any.whl")),
            sha256: Some(sha256_hex(wheel)),
        }
    }

    fn solver_for_a_and_b(&self) -> (Arc<StaticSolver>, Arc<AtomicUsize>) {
        let mut records = BTreeMap::new();
        records.insert(
            "a".to_string(),
            vec![self.record("a", "1.0", &self.wheel_a)],
        );
        records.insert(
            "b".to_string(),
            vec![self.record("b", "2.1", &self.wheel_b)],
        );
        StaticSolver::new(records)
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Files directly under the cache root are in-flight download temps; a
/// settled cache holds only the `cas/` tree.
fn stray_temp_files(cache_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(cache_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect()
}

#[test]
fn cold_install_materializes_blobs_and_dist_info() {
    let fx = Fixture::new();
    let (solver, _calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let site = fx.site_dir("cold");

    let resolved = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string(), "b".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("cold install");

    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].name, "a");
    assert_eq!(resolved[1].name, "b");

    for (record, wheel) in resolved.iter().zip([&fx.wheel_a, &fx.wheel_b]) {
        let blob = installer
            .cas()
            .blob_path(record.sha256.as_deref().expect("digest"));
        assert!(blob.exists(), "blob for {} missing", record.name);
        assert_eq!(fs::read(&blob).expect("blob bytes"), **wheel);
    }
    assert!(site.join("a-1.0.dist-info").is_dir());
    assert!(site.join("b-2.1.dist-info").is_dir());

    // The caller records resolved pins in the manifest after a successful
    // install; the returned records carry everything it needs.
    let mut manifest = fx.manifest();
    for record in &resolved {
        manifest.deps.insert(
            xe_domain::normalize_dep_name(&record.name),
            record.version.clone(),
        );
    }
    assert_eq!(manifest.deps.get("a").map(String::as_str), Some("1.0"));
    assert_eq!(manifest.deps.get("b").map(String::as_str), Some("2.1"));
}

#[test]
fn reordered_requirements_hit_the_solution_cache() {
    let fx = Fixture::new();
    let (solver, calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let site = fx.site_dir("warm");

    let first = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string(), "b".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("first install");
    let solver_calls_after_first = calls.load(Ordering::SeqCst);
    let gets_after_first = fx.server.total_gets();

    let second = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["b".to_string(), "a".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("second install");

    assert_eq!(second, first, "return value must be order-independent");
    assert_eq!(
        calls.load(Ordering::SeqCst),
        solver_calls_after_first,
        "reordered requirements must not re-resolve"
    );
    assert_eq!(
        fx.server.total_gets(),
        gets_after_first,
        "warm install must not touch the network"
    );
}

#[test]
fn integrity_violation_fails_and_leaves_no_blob() {
    let fx = Fixture::new();
    let claimed_digest = sha256_hex(&build_wheel("c", "0.9"));
    let mut records = BTreeMap::new();
    records.insert(
        "c".to_string(),
        vec![PackageRecord {
            name: "c".to_string(),
            version: "0.9".to_string(),
            url: fx.server.url("/c-0.9-py3-none-any.whl"),
            sha256: Some(claimed_digest.clone()),
        }],
    );
    let (solver, _calls) = StaticSolver::new(records);
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let site = fx.site_dir("integrity");

    let err = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["c".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect_err("corrupt body must fail");

    match err.downcast_ref::<InstallError>() {
        Some(InstallError::IntegrityMismatch { expected, .. }) => {
            assert_eq!(expected, &claimed_digest);
        }
        other => panic!("expected IntegrityMismatch, got {other:?}"),
    }
    assert!(
        !installer.cas().blob_path(&claimed_digest).exists(),
        "failed download must not land under the claimed digest"
    );
    assert!(stray_temp_files(&fx.cache_dir()).is_empty());
    assert!(!site.join("c-0.9.dist-info").exists());
}

#[test]
fn cancellation_mid_plan_drains_cleanly() {
    let fx = Fixture::new();
    fx.server.close_gate();
    let (solver, _calls) = fx.solver_for_a_and_b();
    let installer = Arc::new(Installer::new(&fx.cache_dir(), solver).expect("installer"));
    let site = fx.site_dir("cancel");
    let ctx = CancelToken::new();

    let join = {
        let installer = Arc::clone(&installer);
        let ctx = ctx.clone();
        let manifest = fx.manifest();
        let project_dir = fx.temp.path().to_path_buf();
        let site = site.clone();
        thread::spawn(move || {
            installer.install(
                &ctx,
                &manifest,
                &["a".to_string(), "b".to_string()],
                &project_dir,
                Some(&site),
            )
        })
    };

    // Wait until `a` is fully installed and `b` is parked at the gate, then
    // cancel and let the stalled download drain.
    assert!(
        wait_until(Duration::from_secs(10), || {
            site.join("a-1.0.dist-info").is_dir() && fx.server.gate_was_hit()
        }),
        "fixture did not reach the mid-plan state"
    );
    ctx.cancel();
    fx.server.open_gate();

    let err = join
        .join()
        .expect("install thread")
        .expect_err("cancelled install must not succeed");
    assert!(InstallError::is_cancelled(&err), "got {err:?}");

    assert!(stray_temp_files(&fx.cache_dir()).is_empty());
    assert!(
        site.join("a-1.0.dist-info").is_dir(),
        "completed extractions survive cancellation"
    );
}

#[test]
fn cancellation_during_resolve_skips_solver_dispatch() {
    let fx = Fixture::new();
    let (solver, calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let ctx = CancelToken::new();
    ctx.cancel();

    let err = installer
        .install(
            &ctx,
            &fx.manifest(),
            &["a".to_string(), "b".to_string()],
            fx.temp.path(),
            Some(&fx.site_dir("pre-cancel")),
        )
        .expect_err("cancelled before resolve");
    assert!(InstallError::is_cancelled(&err), "got {err:?}");
    assert_eq!(
        calls.load(Ordering::SeqCst),
        0,
        "a cancelled resolve stage must not dispatch solver calls"
    );
    assert_eq!(fx.server.total_gets(), 0);
}

#[test]
fn concurrent_identical_installs_share_the_cache() {
    let fx = Fixture::new();
    let cache = fx.cache_dir();

    let mut joins = Vec::new();
    for label in ["one", "two"] {
        let (solver, _calls) = fx.solver_for_a_and_b();
        let installer = Installer::new(&cache, solver).expect("installer");
        let manifest = fx.manifest();
        let project_dir = fx.temp.path().to_path_buf();
        let site = fx.site_dir(label);
        joins.push(thread::spawn(move || {
            installer.install(
                &CancelToken::new(),
                &manifest,
                &["a".to_string(), "b".to_string()],
                &project_dir,
                Some(&site),
            )
        }));
    }
    for join in joins {
        let resolved = join.join().expect("install thread").expect("install ok");
        assert_eq!(resolved.len(), 2);
    }

    let (solver, _calls) = fx.solver_for_a_and_b();
    let probe = Installer::new(&cache, solver).expect("probe installer");
    assert!(probe.cas().blob_path(&sha256_hex(&fx.wheel_a)).exists());
    assert!(probe.cas().blob_path(&sha256_hex(&fx.wheel_b)).exists());
    assert!(stray_temp_files(&cache).is_empty());
    for label in ["one", "two"] {
        assert!(fx.site_dir(label).join("a-1.0.dist-info").is_dir());
        assert!(fx.site_dir(label).join("b-2.1.dist-info").is_dir());
    }
}

#[test]
fn installed_packages_skip_without_traffic() {
    let fx = Fixture::new();
    let (solver, _calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let site = fx.site_dir("skip");

    installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("seed install");

    // Drop the blob but keep the installed package; a re-run must trust the
    // dist-info marker and never re-fetch.
    let blob = installer.cas().blob_path(&sha256_hex(&fx.wheel_a));
    fs::remove_file(&blob).expect("remove blob");
    let gets_before = fx.server.gets_for("/a-1.0-py3-none-any.whl");

    let resolved = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("skip install");

    assert_eq!(resolved.len(), 1);
    assert_eq!(
        fx.server.gets_for("/a-1.0-py3-none-any.whl"),
        gets_before,
        "already-installed package must not be downloaded"
    );
    assert!(!blob.exists(), "skip path must not recreate the blob");
}

#[test]
fn records_without_urls_are_skipped() {
    let fx = Fixture::new();
    let mut records = BTreeMap::new();
    records.insert(
        "local".to_string(),
        vec![PackageRecord {
            name: "local".to_string(),
            version: "0.1".to_string(),
            url: String::new(),
            sha256: None,
        }],
    );
    let (solver, _calls) = StaticSolver::new(records);
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    let site = fx.site_dir("no-url");

    let resolved = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["local".to_string()],
            fx.temp.path(),
            Some(&site),
        )
        .expect("skip without url");
    assert_eq!(resolved.len(), 1);
    assert_eq!(fx.server.total_gets(), 0);
}

#[test]
fn resolve_failures_surface_the_requirement() {
    let fx = Fixture::new();
    let (solver, _calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");

    let err = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string(), "no-such-package".to_string()],
            fx.temp.path(),
            Some(&fx.site_dir("resolve-err")),
        )
        .expect_err("unknown requirement must fail");

    match err.downcast_ref::<InstallError>() {
        Some(InstallError::ResolveFailed { requirement }) => {
            assert_eq!(requirement, "no-such-package");
        }
        other => panic!("expected ResolveFailed, got {other:?}"),
    }
}

#[test]
fn hash_policy_rejects_digestless_records() {
    let fx = Fixture::new();
    let mut records = BTreeMap::new();
    records.insert(
        "a".to_string(),
        vec![PackageRecord {
            name: "a".to_string(),
            version: "1.0".to_string(),
            url: fx.server.url("/a-1.0-py3-none-any.whl"),
            sha256: None,
        }],
    );
    let (solver, _calls) = StaticSolver::new(records);
    let installer = Installer::new(&fx.cache_dir(), solver)
        .expect("installer")
        .require_hashes(true);

    let err = installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string()],
            fx.temp.path(),
            Some(&fx.site_dir("policy")),
        )
        .expect_err("digestless record must be refused");
    assert!(err.to_string().contains("sha256"), "got {err:#}");
    assert_eq!(fx.server.total_gets(), 0);
}

#[test]
fn persisted_solutions_survive_new_engine_instances() {
    let fx = Fixture::new();
    let (solver, calls) = fx.solver_for_a_and_b();
    let installer = Installer::new(&fx.cache_dir(), solver).expect("installer");
    installer
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string(), "b".to_string()],
            fx.temp.path(),
            Some(&fx.site_dir("persist-one")),
        )
        .expect("first engine install");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A second engine over the same cache must find the stored SolveGraph.
    let (solver2, calls2) = fx.solver_for_a_and_b();
    let second = Installer::new(&fx.cache_dir(), solver2).expect("second engine");
    let resolved = second
        .install(
            &CancelToken::new(),
            &fx.manifest(),
            &["a".to_string(), "b".to_string()],
            fx.temp.path(),
            Some(&fx.site_dir("persist-two")),
        )
        .expect("second engine install");
    assert_eq!(calls2.load(Ordering::SeqCst), 0);
    assert_eq!(resolved.len(), 2);

    // The document on disk keeps the stable field casing.
    let key = xe_core::solve_key(
        "3.12",
        &xe_core::normalize_requirements(&["a".to_string(), "b".to_string()]),
    );
    let raw = fs::read_to_string(
        fx.cache_dir()
            .join("cas")
            .join("solutions")
            .join(format!("{key}.json")),
    )
    .expect("solution document");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert!(value["packages"][0]["Name"].is_string());
    assert!(value["packages"][0]["DownloadURL"].is_string());
    let decoded: SolveGraph = serde_json::from_str(&raw).expect("decodes as graph");
    assert_eq!(decoded.python_version, "3.12");
}
