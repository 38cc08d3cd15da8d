//! Content-addressed blob store plus the keyed solution cache. The CAS is
//! the only authority over blob and solution presence; every path under its
//! root is derived from a digest.

use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use xe_domain::SolveGraph;

use crate::{cancel::CancelToken, error::InstallError, net};

pub struct Cas {
    root: PathBuf,
}

impl Cas {
    /// Open the store rooted at `root`, creating the blob and solution
    /// directories.
    pub fn open(root: &Path) -> Result<Self> {
        let cas = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(cas.blob_dir())
            .with_context(|| format!("failed to create {}", cas.blob_dir().display()))?;
        fs::create_dir_all(cas.solution_dir())
            .with_context(|| format!("failed to create {}", cas.solution_dir().display()))?;
        Ok(cas)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a blob with the given digest lives at, whether or not it exists.
    /// Two hex characters of sharding keep any single directory bounded.
    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        let digest = sha256.to_ascii_lowercase();
        let shard = if digest.len() >= 2 { &digest[..2] } else { "00" };
        self.blob_dir().join(shard).join(format!("{digest}.whl"))
    }

    /// Ensure the blob behind `url` is present and return its path.
    ///
    /// When `expected_sha256` is known and the blob already exists this is a
    /// pure cache hit with no network traffic. Otherwise the body is streamed
    /// into a temporary file inside the cache root (so the final rename stays
    /// on one filesystem) while being hashed, the digest is enforced, and the
    /// file is atomically moved to the path derived from the *actual* digest.
    /// Concurrent callers racing on the same URL are safe: whoever renames
    /// first wins and the loser returns the existing path.
    pub fn store_blob_from_url(
        &self,
        ctx: &CancelToken,
        url: &str,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf> {
        if let Some(expected) = expected_sha256 {
            let target = self.blob_path(expected);
            if target.exists() {
                debug!(url, "blob cache hit");
                return Ok(target);
            }
        }
        if ctx.is_cancelled() {
            return Err(InstallError::Cancelled.into());
        }

        let client = net::http_client()?;
        let response = client.get(url).send().map_err(|err| {
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

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .context("failed to create download temp file")?;
        let mut body = response;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0_u8; 64 * 1024];
        loop {
            if ctx.is_cancelled() {
                return Err(InstallError::Cancelled.into());
            }
            let read = body
                .read(&mut buffer)
                .with_context(|| format!("stream error for {url}"))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            tmp.write_all(&buffer[..read])
                .context("failed to write download temp file")?;
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(InstallError::IntegrityMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                }
                .into());
            }
        }

        let target = self.blob_path(&actual);
        if target.exists() {
            debug!(url, "blob landed concurrently");
            return Ok(target);
        }
        if let Some(shard) = target.parent() {
            fs::create_dir_all(shard)
                .with_context(|| format!("failed to create {}", shard.display()))?;
        }
        match tmp.persist(&target) {
            Ok(_) => {
                debug!(url, blob = %target.display(), "blob stored");
                Ok(target)
            }
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(target),
            Err(err) => {
                Err(anyhow::Error::new(err.error).context(InstallError::Io { path: target }))
            }
        }
    }

    /// Persist a solve graph under `key`, atomically replacing any earlier
    /// solution for the same inputs.
    pub fn save_solution(&self, key: &str, graph: &SolveGraph) -> Result<()> {
        let path = self.solution_path(key);
        let encoded = serde_json::to_vec(graph).context("failed to encode solution")?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.solution_dir())
            .context("failed to create solution temp file")?;
        tmp.write_all(&encoded)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tmp.persist(&path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load the solve graph stored under `key`; a missing file is a cache
    /// miss, a malformed one is an error.
    pub fn load_solution(&self, key: &str) -> Result<Option<SolveGraph>> {
        let path = self.solution_path(key);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read {}", path.display())))
            }
        };
        let graph = serde_json::from_slice(&contents)
            .with_context(|| format!("failed to parse solution {}", path.display()))?;
        Ok(Some(graph))
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("cas").join("blobs")
    }

    fn solution_dir(&self) -> PathBuf {
        self.root.join("cas").join("solutions")
    }

    fn solution_path(&self, key: &str) -> PathBuf {
        self.solution_dir().join(format!("{key}.json"))
    }
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
