// Worker configuration and the runtime registry
use anyhow::{bail, Context, Result};
use sandrun_common::runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::sandbox::ISOLATE_PATH;

const DEFAULT_MAX_CONCURRENT_JOBS: usize = 64;
const DEFAULT_RUNTIMES_PATH: &str = "config/runtimes.json";

/// Process-wide settings, read once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub max_concurrent_jobs: usize,
    pub disable_networking: bool,
    pub isolate_path: PathBuf,
    pub metadata_dir: PathBuf,
    pub runtimes_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            disable_networking: true,
            isolate_path: PathBuf::from(ISOLATE_PATH),
            metadata_dir: PathBuf::from("/tmp"),
            runtimes_path: PathBuf::from(DEFAULT_RUNTIMES_PATH),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_concurrent_jobs = parse_var(
            &lookup,
            "SANDRUN_MAX_CONCURRENT_JOBS",
            defaults.max_concurrent_jobs,
        )?;
        if max_concurrent_jobs == 0 {
            bail!("SANDRUN_MAX_CONCURRENT_JOBS must be at least 1");
        }

        Ok(Self {
            max_concurrent_jobs,
            disable_networking: parse_var(
                &lookup,
                "SANDRUN_DISABLE_NETWORKING",
                defaults.disable_networking,
            )?,
            isolate_path: lookup("SANDRUN_ISOLATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.isolate_path),
            metadata_dir: lookup("SANDRUN_METADATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_dir),
            runtimes_path: lookup("SANDRUN_RUNTIMES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.runtimes_path),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimesJson {
    runtimes: Vec<Runtime>,
}

/// Installed runtimes, in file order
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: Vec<Runtime>,
}

impl RuntimeRegistry {
    /// Load runtime descriptions from a runtimes.json file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Runtime config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: RuntimesJson = serde_json::from_str(content)?;
        Ok(Self {
            runtimes: parsed.runtimes,
        })
    }

    /// Exact version match, or the first registered version when `version`
    /// is `*` or empty.
    pub fn get(&self, language: &str, version: &str) -> Option<&Runtime> {
        let any_version = version.is_empty() || version == "*";
        self.runtimes
            .iter()
            .find(|rt| rt.language == language && (any_version || rt.version == version))
    }

    /// `language-version` of every runtime
    pub fn list_runtimes(&self) -> Vec<String> {
        self.runtimes.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const RUNTIMES: &str = r#"{
        "runtimes": [
            {
                "language": "python",
                "version": "3.12.0",
                "pkgdir": "/pkgs/python/3.12.0",
                "max_process_count": 64,
                "max_open_files": 2048,
                "max_file_size": 10000000,
                "output_max_size": 1024,
                "limits": {
                    "timeouts": {"compile": 10000, "run": 3000},
                    "cpu_times": {"compile": 10000, "run": 3000},
                    "memory_limits": {"compile": -1, "run": -1}
                }
            },
            {
                "language": "python",
                "version": "3.10.0",
                "pkgdir": "/pkgs/python/3.10.0",
                "max_process_count": 64,
                "max_open_files": 2048,
                "max_file_size": 10000000,
                "output_max_size": 1024,
                "limits": {
                    "timeouts": {"compile": 10000, "run": 3000},
                    "cpu_times": {"compile": 10000, "run": 3000},
                    "memory_limits": {"compile": -1, "run": -1}
                }
            },
            {
                "language": "c",
                "version": "10.2.0",
                "compiled": true,
                "env_vars": ["PATH=/pkgs/gcc/bin:/usr/bin"],
                "pkgdir": "/pkgs/gcc/10.2.0",
                "max_process_count": 64,
                "max_open_files": 2048,
                "max_file_size": 10000000,
                "output_max_size": 1024,
                "limits": {
                    "timeouts": {"compile": 10000, "run": 3000},
                    "cpu_times": {"compile": 10000, "run": 3000},
                    "memory_limits": {"compile": 512000000, "run": 256000000}
                }
            }
        ]
    }"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.max_concurrent_jobs, 64);
        assert!(config.disable_networking);
        assert_eq!(config.isolate_path, PathBuf::from("/usr/local/bin/isolate"));
    }

    #[test]
    fn test_config_overrides() {
        let config = WorkerConfig::from_lookup(env(&[
            ("SANDRUN_MAX_CONCURRENT_JOBS", "4"),
            ("SANDRUN_DISABLE_NETWORKING", "false"),
            ("SANDRUN_METADATA_DIR", "/var/run/sandrun"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(!config.disable_networking);
        assert_eq!(config.metadata_dir, PathBuf::from("/var/run/sandrun"));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(WorkerConfig::from_lookup(env(&[("SANDRUN_MAX_CONCURRENT_JOBS", "many")])).is_err());
        assert!(WorkerConfig::from_lookup(env(&[("SANDRUN_MAX_CONCURRENT_JOBS", "0")])).is_err());
        assert!(WorkerConfig::from_lookup(env(&[("SANDRUN_DISABLE_NETWORKING", "yes")])).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RuntimeRegistry::from_json(RUNTIMES).unwrap();

        assert_eq!(registry.get("python", "3.10.0").unwrap().version, "3.10.0");
        assert_eq!(registry.get("python", "*").unwrap().version, "3.12.0");
        assert_eq!(registry.get("python", "").unwrap().version, "3.12.0");
        assert!(registry.get("python", "2.7").is_none());
        assert!(registry.get("ruby", "*").is_none());

        let c = registry.get("c", "10.2.0").unwrap();
        assert!(c.compiled);
        assert_eq!(c.env_vars, vec!["PATH=/pkgs/gcc/bin:/usr/bin".to_string()]);
        assert_eq!(
            registry.list_runtimes(),
            vec!["python-3.12.0", "python-3.10.0", "c-10.2.0"]
        );
    }

    #[test]
    fn test_registry_load_missing_file() {
        let err = RuntimeRegistry::load(Path::new("/nonexistent/runtimes.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_registry_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtimes.json");
        fs::write(&path, RUNTIMES).unwrap();
        assert_eq!(RuntimeRegistry::load(&path).unwrap().list_runtimes().len(), 3);

        fs::write(&path, "{").unwrap();
        assert!(RuntimeRegistry::load(&path).is_err());
    }
}
