use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use super::{Script, ScriptError, ScriptResult};

/// Summary info about a loaded script, surfaced by `ScriptStore::info`
/// without requiring a caller to hold the whole parsed script.
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    pub name: String,
    pub author: Option<String>,
    pub version: Option<String>,
    pub step_count: usize,
    pub next: Option<String>,
    pub dependencies: Vec<String>,
}

impl From<&Script> for ScriptInfo {
    fn from(s: &Script) -> Self {
        Self {
            name: s.name.clone(),
            author: s.author.clone(),
            version: s.version.clone(),
            step_count: s.steps.len(),
            next: s.next.clone(),
            dependencies: s.dependencies.clone(),
        }
    }
}

/// Discovers, loads, validates, and serves scripts from a directory of
/// YAML files. Invalid files are skipped (and reported) during
/// `load_all`/`reload`, rather than aborting the whole scan.
pub struct ScriptStore {
    directory: PathBuf,
    scripts: RwLock<HashMap<String, Script>>,
}

impl ScriptStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            scripts: RwLock::new(HashMap::new()),
        }
    }

    /// Lists `.yaml`/`.yml` files under the configured directory, without
    /// parsing them.
    pub fn scan(&self) -> std::io::Result<Vec<PathBuf>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml")
                || path.extension().and_then(|e| e.to_str()) == Some("yml")
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parses and validates a single script file, without inserting it
    /// into the store.
    pub fn load(&self, path: &Path) -> ScriptResult<Script> {
        let raw = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let script: Script = serde_yaml::from_str(&raw).map_err(|source| ScriptError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        script.validate()?;
        Ok(script)
    }

    /// Scans the directory and loads every valid script, replacing the
    /// current set. Returns the names loaded and the (path, error) pairs
    /// for files that failed to parse or validate.
    pub fn load_all(&self) -> std::io::Result<(Vec<String>, Vec<(PathBuf, ScriptError)>)> {
        let files = self.scan()?;
        let mut loaded = Vec::new();
        let mut failed = Vec::new();
        let mut next_scripts = HashMap::new();

        for path in files {
            match self.load(&path) {
                Ok(script) => {
                    loaded.push(script.name.clone());
                    next_scripts.insert(script.name.clone(), script);
                }
                Err(e) => failed.push((path, e)),
            }
        }

        for script in next_scripts.values() {
            if let Some(next) = &script.next {
                if !next_scripts.contains_key(next) {
                    tracing::warn!(
                        script = %script.name,
                        next = %next,
                        "script chains to an unknown script"
                    );
                }
            }
        }

        *self.scripts.write() = next_scripts;
        Ok((loaded, failed))
    }

    /// Re-scans and reloads every script, replacing the current set (an
    /// alias for `load_all`, kept distinct for callers that want to
    /// express intent — e.g. the CLI's `reload` command).
    pub fn reload(&self) -> std::io::Result<(Vec<String>, Vec<(PathBuf, ScriptError)>)> {
        self.load_all()
    }

    pub fn get(&self, name: &str) -> ScriptResult<Script> {
        self.scripts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::NotFound(name.to_string()))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.scripts.read().contains_key(name)
    }

    pub fn info(&self, name: &str) -> ScriptResult<ScriptInfo> {
        self.scripts
            .read()
            .get(name)
            .map(ScriptInfo::from)
            .ok_or_else(|| ScriptError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn deps(&self, name: &str) -> ScriptResult<Vec<String>> {
        Ok(self.info(name)?.dependencies)
    }
}
