use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use toml_edit::{value, DocumentMut, Item, Table};

pub const MANIFEST_FILENAME: &str = "xe.toml";

const DEFAULT_PYTHON_VERSION: &str = "3.12";
const DEFAULT_CACHE_MODE: &str = "global-cas";

/// Errors raised while decoding a project manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid manifest at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::TomlError,
    },
}

/// The authoritative per-project configuration persisted as `xe.toml`.
///
/// `deps` maps canonical dependency names to a pinned version or `"*"` for
/// unconstrained. The map is a `BTreeMap` so the serialized section is always
/// sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectManifest {
    pub project_name: String,
    pub python_version: String,
    pub deps: BTreeMap<String, String>,
    pub cache_mode: String,
    pub cache_dir: String,
}

impl ProjectManifest {
    pub fn new_default(project_dir: &Path, default_cache_dir: &Path) -> Self {
        Self {
            project_name: dir_basename(project_dir),
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            deps: BTreeMap::new(),
            cache_mode: DEFAULT_CACHE_MODE.to_string(),
            cache_dir: default_cache_dir.display().to_string(),
        }
    }

    /// Build the requirement strings a full re-install of this manifest
    /// needs: `name` for unconstrained deps, `name==version` for pins.
    pub fn requirements(&self) -> Vec<String> {
        self.deps
            .iter()
            .map(|(name, version)| {
                if version.is_empty() || version == "*" {
                    name.clone()
                } else {
                    format!("{name}=={version}")
                }
            })
            .collect()
    }
}

/// Load the manifest in `project_dir`, synthesizing and writing defaults when
/// none exists yet. Returns the manifest together with its path.
pub fn load_or_create_manifest(
    project_dir: &Path,
    default_cache_dir: &Path,
) -> Result<(ProjectManifest, PathBuf)> {
    let path = project_dir.join(MANIFEST_FILENAME);
    if !path.exists() {
        let manifest = ProjectManifest::new_default(project_dir, default_cache_dir);
        save_manifest(&path, &manifest)?;
        return Ok((manifest, path));
    }
    let manifest = load_manifest(&path, default_cache_dir)?;
    Ok((manifest, path))
}

/// Decode a manifest file, backfilling absent fields (python version, cache
/// mode, cache dir) with defaults and leaving everything else untouched.
pub fn load_manifest(path: &Path, default_cache_dir: &Path) -> Result<ProjectManifest> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc: DocumentMut = contents.parse().map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut deps = BTreeMap::new();
    if let Some(table) = doc.get("deps").and_then(Item::as_table) {
        for (name, item) in table {
            if let Some(version) = item.as_str() {
                deps.insert(normalize_dep_name(name), version.to_string());
            }
        }
    }

    let mut python_version = table_str(&doc, "python", "version");
    if python_version.trim().is_empty() {
        python_version = DEFAULT_PYTHON_VERSION.to_string();
    }
    let mut cache_mode = table_str(&doc, "cache", "mode");
    if cache_mode.trim().is_empty() {
        cache_mode = DEFAULT_CACHE_MODE.to_string();
    }
    let mut cache_dir = table_str(&doc, "cache", "global_dir");
    if cache_dir.trim().is_empty() {
        cache_dir = default_cache_dir.display().to_string();
    }

    Ok(ProjectManifest {
        project_name: table_str(&doc, "project", "name"),
        python_version,
        deps,
        cache_mode,
        cache_dir,
    })
}

/// Serialize the manifest with its canonical section order and atomically
/// replace `path`.
pub fn save_manifest(path: &Path, manifest: &ProjectManifest) -> Result<()> {
    let mut doc = DocumentMut::new();

    let mut project = Table::new();
    project.insert("name", value(manifest.project_name.as_str()));
    doc.insert("project", Item::Table(project));

    let mut python = Table::new();
    python.insert("version", value(manifest.python_version.as_str()));
    doc.insert("python", Item::Table(python));

    let mut deps = Table::new();
    for (name, version) in &manifest.deps {
        deps.insert(&normalize_dep_name(name), value(version.as_str()));
    }
    doc.insert("deps", Item::Table(deps));

    let mut cache = Table::new();
    cache.insert("mode", value(manifest.cache_mode.as_str()));
    cache.insert("global_dir", value(manifest.cache_dir.as_str()));
    doc.insert("cache", Item::Table(cache));

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut tmp = tempfile::NamedTempFile::new_in(parent.unwrap_or_else(|| Path::new(".")))
        .context("failed to create manifest temp file")?;
    io::Write::write_all(&mut tmp, doc.to_string().as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Canonical dependency-name spelling: lowercase with `_` and `.` folded to
/// `-`. Idempotent.
pub fn normalize_dep_name(name: &str) -> String {
    name.trim().to_lowercase().replace(['_', '.'], "-")
}

/// Extract the canonical dependency name from a requirement string, dropping
/// extras and version specifiers. Returns `None` for blank input.
pub fn requirement_to_dep_name(requirement: &str) -> Option<String> {
    let trimmed = requirement.trim();
    let mut end = trimmed.len();
    for (idx, ch) in trimmed.char_indices() {
        if ch.is_ascii_whitespace() || matches!(ch, '<' | '>' | '=' | '!' | '~' | ';') {
            end = idx;
            break;
        }
    }
    let head = &trimmed[..end];
    let base = head.split('[').next().unwrap_or(head).trim();
    if base.is_empty() {
        None
    } else {
        Some(normalize_dep_name(base))
    }
}

fn table_str(doc: &DocumentMut, table: &str, key: &str) -> String {
    doc.get(table)
        .and_then(Item::as_table)
        .and_then(|t| t.get(key))
        .and_then(Item::as_str)
        .unwrap_or_default()
        .to_string()
}

fn dir_basename(dir: &Path) -> String {
    dir.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("project")
        .to_string()
}
