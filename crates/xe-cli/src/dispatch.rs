use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use tracing::warn;
use xe_core::{
    paths, CancelToken, InstallError, Installer, PipReportSolver, PythonRuntime, RuntimeProvider,
};
use xe_domain::{
    load_manifest, load_or_create_manifest, normalize_dep_name, requirement_to_dep_name,
    save_manifest, ManifestError, PackageRecord, ProjectManifest, MANIFEST_FILENAME,
};

use crate::cli::{CacheCli, CommandCli, PythonCli};

pub fn dispatch_command(command: &CommandCli) -> Result<()> {
    match command {
        CommandCli::Init { name, python } => cmd_init(name.as_deref(), python.as_deref()),
        CommandCli::Add {
            requirements,
            require_hashes,
        } => cmd_add(requirements, *require_hashes),
        CommandCli::Remove { names } => cmd_remove(names),
        CommandCli::Lock => cmd_lock(),
        CommandCli::Sync => cmd_sync(),
        CommandCli::Import { path } => cmd_import(path),
        CommandCli::Cache(cache) => match cache {
            CacheCli::Dir => cmd_cache_dir(),
            CacheCli::Clean => cmd_cache_clean(),
        },
        CommandCli::Python(python) => match python {
            PythonCli::Install { version } => cmd_python_install(version),
            PythonCli::Find => cmd_python_find(),
            PythonCli::Dir => cmd_python_dir(),
        },
    }
}

struct ProjectContext {
    manifest: ProjectManifest,
    manifest_path: PathBuf,
    project_dir: PathBuf,
}

fn project_context() -> Result<ProjectContext> {
    let project_dir = env::current_dir().context("failed to get cwd")?;
    let (manifest, manifest_path) =
        load_or_create_manifest(&project_dir, &paths::default_cache_dir())
            .map_err(|err| config_error(err, &project_dir))?;
    Ok(ProjectContext {
        manifest,
        manifest_path,
        project_dir,
    })
}

fn config_error(err: anyhow::Error, project_dir: &Path) -> anyhow::Error {
    if err.downcast_ref::<ManifestError>().is_some() {
        err.context(InstallError::ConfigInvalid {
            path: project_dir.join(MANIFEST_FILENAME),
        })
    } else {
        err
    }
}

fn build_installer(manifest: &ProjectManifest, require_hashes: bool) -> Result<Installer> {
    let runtime = Arc::new(PythonRuntime::new()?);
    let python_exe = match runtime.ensure(&manifest.python_version) {
        Ok(exe) => exe,
        Err(err) => match xe_core::detect_system_interpreter() {
            Some(system) => {
                warn!(
                    version = %manifest.python_version,
                    error = %err,
                    fallback = %system.display(),
                    "managed interpreter unavailable; using system python"
                );
                system
            }
            None => return Err(err.context("no usable python interpreter")),
        },
    };
    let solver = Arc::new(PipReportSolver::new(python_exe));
    Ok(Installer::new(Path::new(&manifest.cache_dir), solver)?
        .with_runtime(runtime)
        .require_hashes(require_hashes))
}

fn record_resolved(manifest: &mut ProjectManifest, resolved: &[PackageRecord]) {
    for record in resolved {
        manifest
            .deps
            .insert(normalize_dep_name(&record.name), record.version.clone());
    }
}

fn cmd_init(name: Option<&str>, python: Option<&str>) -> Result<()> {
    let mut project_dir = env::current_dir().context("failed to get cwd")?;
    if let Some(name) = name {
        if name != "." {
            project_dir = project_dir.join(name);
            fs::create_dir_all(&project_dir)
                .with_context(|| format!("failed to create {}", project_dir.display()))?;
        }
    }
    let (mut manifest, manifest_path) =
        load_or_create_manifest(&project_dir, &paths::default_cache_dir())?;
    if let Some(version) = python {
        manifest.python_version = version.to_string();
        save_manifest(&manifest_path, &manifest)?;
    }
    println!("Initialized project at {}", manifest_path.display());
    Ok(())
}

fn cmd_add(requirements: &[String], require_hashes: bool) -> Result<()> {
    let mut ctx = project_context()?;
    let installer = build_installer(&ctx.manifest, require_hashes)?;
    let resolved = installer.install(
        &CancelToken::new(),
        &ctx.manifest,
        requirements,
        &ctx.project_dir,
        None,
    )?;

    for requirement in requirements {
        if let Some(dep_name) = requirement_to_dep_name(requirement) {
            ctx.manifest.deps.entry(dep_name).or_insert_with(|| "*".to_string());
        }
    }
    record_resolved(&mut ctx.manifest, &resolved);
    save_manifest(&ctx.manifest_path, &ctx.manifest)?;
    println!("Installed {} package(s)", resolved.len());
    Ok(())
}

fn cmd_remove(names: &[String]) -> Result<()> {
    let mut ctx = project_context()?;
    let mut removed = 0_usize;
    for raw in names {
        if let Some(name) = requirement_to_dep_name(raw) {
            if ctx.manifest.deps.remove(&name).is_some() {
                removed += 1;
            }
        }
    }
    if removed == 0 {
        bail!("none of the given packages are declared in {MANIFEST_FILENAME}");
    }
    save_manifest(&ctx.manifest_path, &ctx.manifest)?;
    println!(
        "Removed {removed} package(s) from {MANIFEST_FILENAME}; run `xe sync` against a clean target to rebuild the environment"
    );
    Ok(())
}

fn cmd_lock() -> Result<()> {
    let mut ctx = project_context()?;
    let requirements = ctx.manifest.requirements();
    let installer = build_installer(&ctx.manifest, false)?;
    let resolved = installer.install(
        &CancelToken::new(),
        &ctx.manifest,
        &requirements,
        &ctx.project_dir,
        None,
    )?;
    record_resolved(&mut ctx.manifest, &resolved);
    save_manifest(&ctx.manifest_path, &ctx.manifest)?;
    println!("Locked {} package(s)", resolved.len());
    Ok(())
}

fn cmd_sync() -> Result<()> {
    let ctx = project_context()?;
    let requirements = ctx.manifest.requirements();
    let installer = build_installer(&ctx.manifest, false)?;
    let resolved = installer.install(
        &CancelToken::new(),
        &ctx.manifest,
        &requirements,
        &ctx.project_dir,
        None,
    )?;
    println!("Synced {} package(s) from {MANIFEST_FILENAME}", resolved.len());
    Ok(())
}

fn cmd_import(path: &Path) -> Result<()> {
    let requirements = if path.file_name().and_then(|s| s.to_str()) == Some(MANIFEST_FILENAME) {
        let imported = load_manifest(path, &paths::default_cache_dir())?;
        if imported.deps.is_empty() {
            bail!("no dependencies found in {}", path.display());
        }
        imported.requirements()
    } else {
        parse_requirements_file(path)?
    };
    if requirements.is_empty() {
        bail!("no installable entries found in {}", path.display());
    }

    let mut ctx = project_context()?;
    let installer = build_installer(&ctx.manifest, false)?;
    let resolved = installer.install(
        &CancelToken::new(),
        &ctx.manifest,
        &requirements,
        &ctx.project_dir,
        None,
    )?;
    for requirement in &requirements {
        if let Some(dep_name) = requirement_to_dep_name(requirement) {
            ctx.manifest.deps.entry(dep_name).or_insert_with(|| "*".to_string());
        }
    }
    record_resolved(&mut ctx.manifest, &resolved);
    save_manifest(&ctx.manifest_path, &ctx.manifest)?;
    println!("Imported {} requirement(s)", requirements.len());
    Ok(())
}

fn parse_requirements_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(ToString::to_string)
        .collect())
}

fn cmd_cache_dir() -> Result<()> {
    let ctx = project_context()?;
    println!("{}", ctx.manifest.cache_dir);
    Ok(())
}

fn cmd_cache_clean() -> Result<()> {
    let ctx = project_context()?;
    let cache_dir = PathBuf::from(&ctx.manifest.cache_dir);
    if cache_dir.exists() {
        fs::remove_dir_all(&cache_dir)
            .with_context(|| format!("failed to clean {}", cache_dir.display()))?;
    }
    println!("Cache cleaned");
    Ok(())
}

fn cmd_python_install(version: &str) -> Result<()> {
    let runtime = PythonRuntime::new()?;
    let exe = runtime.ensure(version)?;
    println!("Python {} available at {}", version, exe.display());
    Ok(())
}

fn cmd_python_find() -> Result<()> {
    let ctx = project_context()?;
    let runtime = PythonRuntime::new()?;
    match runtime.find_exe(&ctx.manifest.python_version) {
        Ok(exe) => println!("{}", exe.display()),
        Err(_) => match xe_core::detect_system_interpreter() {
            Some(system) => println!("{}", system.display()),
            None => bail!(
                "no interpreter found for python {}; run `xe python install {}`",
                ctx.manifest.python_version,
                ctx.manifest.python_version
            ),
        },
    }
    Ok(())
}

fn cmd_python_dir() -> Result<()> {
    println!("{}", paths::python_install_root().display());
    Ok(())
}
