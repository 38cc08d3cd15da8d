//! Interpreter provisioning. The engine treats this module through the
//! [`RuntimeProvider`] trait only; everything else here is implementation
//! detail of the managed-CPython provider.

use std::{
    cmp::Ordering,
    env,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::{cancel::CancelToken, error::InstallError, net, paths, store::wheel};

const RELEASE_INDEX_URL: &str = "https://www.python.org/ftp/python/";
const STANDALONE_RELEASE: &str = "20241016";
const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";

/// Locates or installs an interpreter and answers where packages go.
pub trait RuntimeProvider: Send + Sync {
    /// Ensure an interpreter matching `version` exists and return its
    /// executable path.
    fn ensure(&self, version: &str) -> Result<PathBuf>;

    /// The interpreter's first site-packages directory, created if absent.
    fn site_packages(&self, version: &str) -> Result<PathBuf>;
}

/// Managed CPython installs under the xe install root, one directory per
/// `major.minor`.
pub struct PythonRuntime {
    base_dir: PathBuf,
}

impl PythonRuntime {
    pub fn new() -> Result<Self> {
        let base_dir = paths::python_install_root();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn version_dir(&self, version: &str) -> Result<PathBuf> {
        let (major, minor) = parse_major_minor(version)?;
        Ok(self.base_dir.join(format!("python{major}{minor}")))
    }

    /// Find an already-installed interpreter for `version`, without probing
    /// its health.
    pub fn find_exe(&self, version: &str) -> Result<PathBuf> {
        let dir = self.version_dir(version)?;
        let candidates = if cfg!(windows) {
            vec![dir.join("tools").join("python.exe"), dir.join("python.exe")]
        } else {
            vec![dir.join("bin").join("python3"), dir.join("bin").join("python")]
        };
        for candidate in candidates {
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        bail!("no python {} interpreter under {}", version, dir.display())
    }

    fn install(&self, version: &str) -> Result<()> {
        if cfg!(windows) {
            self.install_windows(version)
        } else {
            self.install_standalone(version)
        }
    }

    fn install_standalone(&self, version: &str) -> Result<()> {
        let full_version = resolve_full_version(version)?;
        let target_dir = self.version_dir(version)?;
        let arch = match env::consts::ARCH {
            "x86_64" => "x86_64",
            "aarch64" => "aarch64",
            other => bail!("no standalone python build for architecture {other}"),
        };
        let url = format!(
            "https://github.com/indygreg/python-build-standalone/releases/download/{rel}/cpython-{full_version}+{rel}-{arch}-unknown-linux-gnu-install_only.tar.gz",
            rel = STANDALONE_RELEASE,
        );
        info!(version = %full_version, %url, "downloading standalone python");
        let tarball = download_to_temp(&url, &self.base_dir)?;
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        unpack_standalone(tarball.path(), &target_dir)?;
        Ok(())
    }

    fn install_windows(&self, version: &str) -> Result<()> {
        let full_version = resolve_installer_version(version)?;
        let target_dir = self.version_dir(version)?;
        if let Some(parent) = target_dir.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let url = format!(
            "https://www.python.org/ftp/python/{full_version}/python-{full_version}-amd64.exe"
        );
        info!(version = %full_version, %url, "downloading official python installer");
        let installer = download_to_temp_with_suffix(&url, &self.base_dir, ".exe")?;

        let output = Command::new(installer.path())
            .arg("/quiet")
            .arg("InstallAllUsers=0")
            .arg("Include_pip=1")
            .arg("Include_launcher=1")
            .arg("PrependPath=1")
            .arg(format!("TargetDir={}", target_dir.display()))
            .output()
            .context("failed to run python installer")?;
        if output.status.success() {
            return Ok(());
        }

        warn!(
            status = %output.status,
            "official installer failed; falling back to embeddable distribution"
        );
        if target_dir.exists() {
            fs::remove_dir_all(&target_dir)
                .with_context(|| format!("failed to reset {}", target_dir.display()))?;
        }
        self.install_windows_embeddable(&full_version, &target_dir)
    }

    fn install_windows_embeddable(&self, full_version: &str, target_dir: &Path) -> Result<()> {
        let url = format!(
            "https://www.python.org/ftp/python/{full_version}/python-{full_version}-embed-amd64.zip"
        );
        info!(version = full_version, %url, "downloading embeddable python");
        let archive = download_to_temp(&url, &self.base_dir)?;
        fs::create_dir_all(target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        // Runtime provisioning runs outside any install cancel scope.
        wheel::extract_wheel(&CancelToken::new(), archive.path(), target_dir)?;
        patch_embeddable_pth(target_dir)?;
        let exe = target_dir.join("python.exe");
        if exe.exists() {
            if let Err(err) = bootstrap_pip(&exe) {
                warn!(error = %err, "pip bootstrap failed");
            }
        }
        Ok(())
    }
}

impl RuntimeProvider for PythonRuntime {
    fn ensure(&self, version: &str) -> Result<PathBuf> {
        if let Ok(exe) = self.find_exe(version) {
            if is_runtime_healthy(&exe) {
                debug!(version, exe = %exe.display(), "python already installed");
                return Ok(exe);
            }
            warn!(version, exe = %exe.display(), "existing runtime failed health probe; reinstalling");
        }
        self.install(version)?;
        let exe = self.find_exe(version)?;
        if !is_runtime_healthy(&exe) {
            return Err(InstallError::RuntimeUnhealthy.into());
        }
        Ok(exe)
    }

    fn site_packages(&self, version: &str) -> Result<PathBuf> {
        let dir = self.version_dir(version)?;
        let site = if cfg!(windows) {
            let lib_root = if dir.join("tools").join("Lib").exists() {
                dir.join("tools")
            } else {
                dir
            };
            lib_root.join("Lib").join("site-packages")
        } else {
            let (major, minor) = parse_major_minor(version)?;
            dir.join("lib")
                .join(format!("python{major}.{minor}"))
                .join("site-packages")
        };
        fs::create_dir_all(&site)
            .with_context(|| format!("failed to create {}", site.display()))?;
        Ok(site)
    }
}

/// A system interpreter usable when no managed install is wanted. The
/// `XE_PYTHON` override wins; otherwise the first `python3`/`python` on PATH.
pub fn detect_system_interpreter() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os("XE_PYTHON") {
        return Some(PathBuf::from(explicit));
    }
    for candidate in ["python3", "python"] {
        if let Ok(path) = which::which(candidate) {
            return Some(path);
        }
    }
    None
}

/// Inline health probe: a runtime that cannot import `encodings` and `site`
/// cannot run pip or user code.
pub fn is_runtime_healthy(exe: &Path) -> bool {
    let output = Command::new(exe)
        .args(["-c", "import encodings,site; print('ok')"])
        .output();
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).contains("ok"),
        _ => false,
    }
}

fn parse_major_minor(version: &str) -> Result<(u32, u32)> {
    let mut parts = version.split('.');
    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        bail!("invalid python version {version}");
    };
    let major = major
        .parse::<u32>()
        .with_context(|| format!("invalid python major version in {version}"))?;
    let minor = minor
        .parse::<u32>()
        .with_context(|| format!("invalid python minor version in {version}"))?;
    Ok((major, minor))
}

/// Resolve an `X.Y` selector to the highest published `X.Y.Z` via the release
/// index, falling back to a pinned table when the index is unreachable.
fn resolve_full_version(version: &str) -> Result<String> {
    if version.split('.').count() >= 3 {
        return Ok(version.to_string());
    }
    parse_major_minor(version)?;
    match list_patch_versions(version) {
        Ok(mut candidates) if !candidates.is_empty() => {
            candidates.sort_by(|a, b| compare_version(a, b).reverse());
            Ok(candidates.remove(0))
        }
        Ok(_) | Err(_) => match patch_fallback(version) {
            Some(pinned) => Ok(pinned.to_string()),
            None => Ok(format!("{version}.0")),
        },
    }
}

fn resolve_installer_version(version: &str) -> Result<String> {
    let resolved = resolve_full_version(version)?;
    if installer_exists(&resolved) {
        return Ok(resolved);
    }
    if let Some(pinned) = patch_fallback(version) {
        return Ok(pinned.to_string());
    }
    Ok(resolved)
}

fn list_patch_versions(version: &str) -> Result<Vec<String>> {
    let body = net::http_client()?
        .get(RELEASE_INDEX_URL)
        .send()
        .context("failed to request python release index")?
        .error_for_status()
        .context("python release index request failed")?
        .text()
        .context("failed to decode python release index")?;
    let re = Regex::new(r#"href="(\d+\.\d+\.\d+)/""#).expect("static pattern");
    let prefix = format!("{version}.");
    Ok(re
        .captures_iter(&body)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|v| v.starts_with(&prefix))
        .collect())
}

fn installer_exists(version: &str) -> bool {
    let url = format!(
        "https://www.python.org/ftp/python/{version}/python-{version}-amd64.exe"
    );
    let Ok(client) = net::http_client() else {
        return false;
    };
    client
        .head(&url)
        .send()
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}

fn patch_fallback(version: &str) -> Option<&'static str> {
    match version {
        "3.9" => Some("3.9.20"),
        "3.10" => Some("3.10.15"),
        "3.11" => Some("3.11.10"),
        "3.12" => Some("3.12.7"),
        "3.13" => Some("3.13.0"),
        _ => None,
    }
}

fn compare_version(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u32> {
        v.split('.').map(|s| s.parse::<u32>().unwrap_or(0)).collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    for i in 0..pa.len().max(pb.len()) {
        let va = pa.get(i).copied().unwrap_or(0);
        let vb = pb.get(i).copied().unwrap_or(0);
        match va.cmp(&vb) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

fn download_to_temp(url: &str, dir: &Path) -> Result<tempfile::NamedTempFile> {
    download_to_temp_with_suffix(url, dir, "")
}

fn download_to_temp_with_suffix(
    url: &str,
    dir: &Path,
    suffix: &str,
) -> Result<tempfile::NamedTempFile> {
    let response = net::http_client()?
        .get(url)
        .send()
        .map_err(|err| {
            anyhow::Error::new(InstallError::Network {
                url: url.to_string(),
                status: err.to_string(),
            })
        })?;
    if !response.status().is_success() {
        return Err(InstallError::Network {
            url: url.to_string(),
            status: response.status().to_string(),
        }
        .into());
    }
    let mut tmp = tempfile::Builder::new()
        .prefix("xe-runtime-")
        .suffix(suffix)
        .tempfile_in(dir)
        .context("failed to create runtime temp file")?;
    let mut body = response;
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = body
            .read(&mut buffer)
            .with_context(|| format!("stream error for {url}"))?;
        if read == 0 {
            break;
        }
        tmp.write_all(&buffer[..read])
            .context("failed to write runtime temp file")?;
    }
    Ok(tmp)
}

/// Unpack an `install_only` tarball. Its entries carry a leading `python/`
/// component; stripping it puts `bin/` and `lib/` directly under the version
/// directory, where `find_exe` and `site_packages` expect them.
fn unpack_standalone(tarball: &Path, target_dir: &Path) -> Result<()> {
    let file = File::open(tarball)
        .with_context(|| format!("failed to open {}", tarball.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().context("failed to read runtime archive")? {
        let mut entry = entry.context("failed to read runtime archive entry")?;
        let path = entry
            .path()
            .context("runtime archive entry has an invalid path")?
            .into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        entry
            .unpack(target_dir.join(&stripped))
            .with_context(|| format!("failed to unpack {}", stripped.display()))?;
    }
    Ok(())
}

fn patch_embeddable_pth(python_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(python_dir)
        .with_context(|| format!("failed to read {}", python_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.to_lowercase().ends_with("._pth") {
            continue;
        }
        let path = entry.path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if content.contains("\nimport site") || content.starts_with("import site") {
            continue;
        }
        let updated = if content.contains("#import site") {
            content.replace("#import site", "import site")
        } else {
            format!("{content}\nimport site\n")
        };
        fs::write(&path, updated)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn bootstrap_pip(python_exe: &Path) -> Result<()> {
    let script_dir = python_exe.parent().unwrap_or_else(|| Path::new("."));
    let script = download_to_temp_with_suffix(GET_PIP_URL, script_dir, ".py")?;
    let output = Command::new(python_exe)
        .arg(script.path())
        .output()
        .context("failed to bootstrap pip")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("pip bootstrap exited with {}: {}", output.status, stderr);
    }
    Ok(())
}
