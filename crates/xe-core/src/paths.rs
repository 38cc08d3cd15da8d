//! Platform-dependent locations for xe state. Every function here is a pure
//! computation over the environment; directory creation is always the
//! caller's explicit decision.

use std::{env, path::PathBuf};

/// Root of all global xe state: `%LOCALAPPDATA%/xe` on Windows,
/// `$HOME/.local/share/xe` elsewhere.
pub fn xe_home() -> PathBuf {
    if cfg!(windows) {
        if let Some(local) = env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("xe");
        }
        return home_dir().join("AppData").join("Local").join("xe");
    }
    home_dir().join(".local").join("share").join("xe")
}

/// Default location of the global CAS cache when the project manifest does
/// not override it.
pub fn default_cache_dir() -> PathBuf {
    if cfg!(windows) {
        return xe_home().join("cache");
    }
    home_dir().join(".cache").join("xe")
}

/// Root under which managed interpreters are installed, one directory per
/// `pythonXY` version.
pub fn python_install_root() -> PathBuf {
    if cfg!(windows) {
        if let Some(local) = env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("Programs").join("Python");
        }
    }
    xe_home().join("python")
}

pub fn shim_dir() -> PathBuf {
    xe_home().join("bin")
}

pub fn config_file() -> PathBuf {
    xe_home().join("config.toml")
}

fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
