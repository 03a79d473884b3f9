use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// Per-project settings file, looked up in the project directory.
pub const CONFIG_FILE: &str = "pybuild.toml";

/// A `pybuild.toml` after `extends` and `imports` have been resolved.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::config(format!(
                "invalid [{}] in {}: {e}",
                path,
                self.path.display()
            ))
        })?;
        Ok(Some(parsed))
    }

    pub fn settings(&self) -> Result<ProjectSettings> {
        Ok(ProjectSettings {
            python: self.deserialize_path("python")?.unwrap_or_default(),
            environment: self.deserialize_path("environment")?.unwrap_or_default(),
            commands: self.deserialize_path("commands")?.unwrap_or_default(),
            cleanup: self.deserialize_path("cleanup")?.unwrap_or_default(),
            editor: self.deserialize_path("editor")?.unwrap_or_default(),
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_build_args() -> Vec<String> {
    vec!["build_ext".into(), "-i".into()]
}

fn default_clean_args() -> Vec<String> {
    vec!["clean".into(), "-a".into()]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    pub interpreter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    #[serde(default = "default_true")]
    pub inherit: bool,
    pub dotenv: Option<String>,
    pub vars: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            inherit: true,
            dotenv: None,
            vars: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    #[serde(default = "default_build_args")]
    pub build: Vec<String>,
    #[serde(default = "default_clean_args")]
    pub clean: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            build: default_build_args(),
            clean: default_clean_args(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Argv template; `{file}`, `{line}`, `{line0}` and `{column}` are substituted.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectSettings {
    pub python: PythonConfig,
    pub environment: EnvironmentConfig,
    pub commands: CommandsConfig,
    pub cleanup: CleanupConfig,
    pub editor: EditorConfig,
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, value: &mut Value) -> Result<Vec<String>> {
    let Some(tbl) = value.as_table_mut() else {
        return Ok(Vec::new());
    };
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(arr) = raw else {
        return Err(Error::config(format!(
            "'imports' in {} must be an array of paths",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// Precedence, lowest first: `extends` base, each `imports` entry in order, the file itself.
fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    let extends = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"));
    if let Some(ext) = extends {
        let Some(ext) = ext.as_str() else {
            return Err(Error::config(format!(
                "'extends' in {} must be a path",
                path.display()
            )));
        };
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }

    for imp in take_imports(path, &mut value)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    tracing::debug!(path = %path.display(), "loaded project config");
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Loads `<dir>/pybuild.toml`, or an empty document when the project has none.
pub fn load_for_project(dir: &Path) -> Result<ConfigDoc> {
    let path = dir.join(CONFIG_FILE);
    if path.is_file() {
        load(&path)
    } else {
        Ok(ConfigDoc::empty(path))
    }
}
