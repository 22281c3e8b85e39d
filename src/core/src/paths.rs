//! Platform base directories following the XDG Base Directory convention.
//!
//! `$XDG_CACHE_HOME` / `$XDG_CONFIG_HOME` always win when set and non-empty.
//! Otherwise a per-OS table supplies the base; there is no OS-specific logic
//! anywhere else in the codebase.

use std::path::PathBuf;

/// OS family, as far as directory conventions are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    MacOs,
    Windows,
}

impl OsFamily {
    /// The family the binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            OsFamily::MacOs
        } else if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }
}

/// Which base directory is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Cache,
    Config,
}

/// Returns the cache base directory.
///
/// `$XDG_CACHE_HOME` if set; otherwise `$HOME/.cache` (Linux),
/// `$HOME/Library/Caches` (macOS), or `%LOCALAPPDATA%` (Windows).
pub fn cache_home() -> PathBuf {
    resolve(Purpose::Cache, OsFamily::current(), &std_env)
}

/// Returns the config base directory.
///
/// `$XDG_CONFIG_HOME` if set; otherwise `$HOME/.config` (Linux),
/// `$HOME/Library/Application Support` (macOS), or `%LOCALAPPDATA%`
/// (Windows).
pub fn config_home() -> PathBuf {
    resolve(Purpose::Config, OsFamily::current(), &std_env)
}

fn std_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn resolve(purpose: Purpose, os: OsFamily, env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    let xdg_var = match purpose {
        Purpose::Cache => "XDG_CACHE_HOME",
        Purpose::Config => "XDG_CONFIG_HOME",
    };
    if let Some(xdg) = env(xdg_var) {
        if !xdg.trim().is_empty() {
            return PathBuf::from(xdg);
        }
    }

    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let fallback = home.join(match purpose {
        Purpose::Cache => ".cache",
        Purpose::Config => ".config",
    });

    match (os, purpose) {
        (OsFamily::Linux, _) => fallback,
        (OsFamily::MacOs, Purpose::Cache) => home.join("Library").join("Caches"),
        (OsFamily::MacOs, Purpose::Config) => home.join("Library").join("Application Support"),
        (OsFamily::Windows, _) => match env("LOCALAPPDATA") {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => {
                tracing::warn!("LOCALAPPDATA is unset or empty, falling back to {}", fallback.display());
                fallback
            }
        },
    }
}
