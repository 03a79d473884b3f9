use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{self, CONFIG_FILE, EnvironmentConfig, ProjectSettings};
use crate::error::{Error, Result};
use crate::session::{BuildRequest, PostAction};

/// The build descriptor every project must carry.
pub const BUILD_DESCRIPTOR: &str = "setup.py";

/// Environment variable that overrides the interpreter when the config names none.
pub const PYTHON_ENV: &str = "PYBUILD_PYTHON";

const DEFAULT_DOTENV: &str = ".env";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildAction {
    /// `setup.py build_ext -i` (or `[commands].build`).
    BuildInPlace,
    /// `setup.py clean -a` (or `[commands].clean`) followed by the source-tree sweep.
    CleanAll,
    Custom(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub settings: ProjectSettings,
}

impl Project {
    /// Opens the project rooted at `dir`. The directory must exist; `setup.py` is checked
    /// later, right before a build is started.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::config(format!(
                "project directory {} does not exist; open a project first",
                dir.display()
            )));
        }
        let dir = dir.canonicalize()?;
        let settings = config::load_for_project(&dir)?.settings()?;
        Ok(Self { dir, settings })
    }

    /// Walks up from `start` to the first directory holding `pybuild.toml` or `setup.py`.
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start.canonicalize().map_err(|e| {
            Error::config(format!("cannot resolve {}: {e}", start.display()))
        })?;
        let found = start
            .ancestors()
            .find(|d| d.join(CONFIG_FILE).is_file() || d.join(BUILD_DESCRIPTOR).is_file());
        match found {
            Some(dir) => Self::open(dir),
            None => Err(Error::config(format!(
                "no {BUILD_DESCRIPTOR} or {CONFIG_FILE} found in {} or any parent directory",
                start.display()
            ))),
        }
    }

    pub fn build_descriptor(&self) -> PathBuf {
        self.dir.join(BUILD_DESCRIPTOR)
    }

    pub fn environment(&self) -> Result<BTreeMap<String, String>> {
        let inherited = if self.settings.environment.inherit {
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect()
        } else {
            BTreeMap::new()
        };
        build_environment(&self.dir, &self.settings.environment, inherited)
    }

    pub fn interpreter(&self, env: &BTreeMap<String, String>) -> PathBuf {
        resolve_interpreter(&self.dir, self.settings.python.interpreter.as_deref(), env)
    }

    pub fn args_for(&self, action: &BuildAction) -> Vec<String> {
        match action {
            BuildAction::BuildInPlace => self.settings.commands.build.clone(),
            BuildAction::CleanAll => self.settings.commands.clean.clone(),
            BuildAction::Custom(args) => args.clone(),
        }
    }

    pub fn request(&self, action: &BuildAction) -> Result<BuildRequest> {
        let environment = self.environment()?;
        let interpreter = self.interpreter(&environment);
        let post_action = match action {
            BuildAction::CleanAll if self.settings.cleanup.enabled => PostAction::CleanupScan,
            _ => PostAction::None,
        };
        Ok(BuildRequest {
            project_dir: self.dir.clone(),
            interpreter,
            environment,
            arguments: self.args_for(action),
            post_action,
        })
    }
}

/// Layers the environment: `inherited`, then the dotenv file, then `[environment.vars]`.
pub fn build_environment(
    dir: &Path,
    cfg: &EnvironmentConfig,
    inherited: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut env = inherited;

    let dotenv_path = match cfg.dotenv.as_deref().map(str::trim) {
        Some(p) if !p.is_empty() => {
            let p = dir.join(p);
            if !p.is_file() {
                return Err(Error::config(format!(
                    "dotenv file {} does not exist",
                    p.display()
                )));
            }
            Some(p)
        }
        _ => Some(dir.join(DEFAULT_DOTENV)).filter(|p| p.is_file()),
    };
    if let Some(path) = dotenv_path {
        let iter = dotenv::from_path_iter(&path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        for item in iter {
            let (k, v) = item
                .map_err(|e| Error::config(format!("invalid entry in {}: {e}", path.display())))?;
            env.insert(k, v);
        }
        tracing::debug!(path = %path.display(), "applied dotenv file");
    }

    for (k, v) in &cfg.vars {
        env.insert(k.clone(), v.clone());
    }
    Ok(env)
}

/// Interpreter precedence: configured value, `$PYBUILD_PYTHON`, the active virtualenv,
/// then the platform's default `python3`/`python` from `PATH`.
pub fn resolve_interpreter(
    dir: &Path,
    configured: Option<&str>,
    env: &BTreeMap<String, String>,
) -> PathBuf {
    let explicit = configured
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| env.get(PYTHON_ENV).map(|s| s.trim()).filter(|s| !s.is_empty()));
    if let Some(raw) = explicit {
        let p = PathBuf::from(raw);
        // Bare names are left for PATH lookup; relative paths are rooted at the project.
        if p.is_relative() && p.components().count() > 1 {
            return dir.join(p);
        }
        return p;
    }

    if let Some(venv) = env.get("VIRTUAL_ENV").filter(|s| !s.trim().is_empty()) {
        let candidate = if cfg!(windows) {
            Path::new(venv).join("Scripts").join("python.exe")
        } else {
            Path::new(venv).join("bin").join("python")
        };
        if candidate.is_file() {
            return candidate;
        }
    }

    PathBuf::from(if cfg!(windows) { "python" } else { "python3" })
}
