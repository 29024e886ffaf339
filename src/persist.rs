//! Small JSON state file shared between processes.
//!
//! The runner polls `current_mode` from here once per tee chunk; anything
//! other than `"realtime"` ends the run. Writes go through a temporary file
//! and a rename so readers never observe a partial document.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use tracing::warn;

use crate::{capture::StopSource, error::Result};

pub const MODE_KEY: &str = "current_mode";
pub const MODE_REALTIME: &str = "realtime";

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed document, or `None` if missing, unreadable, or not a JSON object
    fn load(&self) -> Option<Map<String, Value>> {
        let text = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.load()?.remove(key)
    }

    /// Set `key`, replacing an unreadable document with a fresh one
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut map = self.load().unwrap_or_else(|| {
            if self.path.exists() {
                warn!(path = %self.path.display(), "Overwriting unreadable state file");
            }
            Map::new()
        });
        map.insert(key.to_owned(), value);
        atomic_write(&self.path, &serde_json::to_vec_pretty(&Value::Object(map))?)?;
        Ok(())
    }

    pub fn mode(&self) -> Option<String> {
        match self.get(MODE_KEY)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_mode(&self, mode: &str) -> Result<()> {
        self.set(MODE_KEY, Value::String(mode.to_owned()))
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

/// Stops the run as soon as the state file no longer says `realtime`.
/// A missing or unreadable file counts as a stop request.
#[derive(Debug, Clone)]
pub struct ModeWatch {
    file: StateFile,
}

impl ModeWatch {
    pub fn new(file: StateFile) -> Self {
        Self { file }
    }
}

impl StopSource for ModeWatch {
    fn should_stop(&self) -> bool {
        self.file.mode().as_deref() != Some(MODE_REALTIME)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_get_missing_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = StateFile::new(dir.path().join("missing.json"));
        assert_eq!(missing.get("x"), None);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "not-json").unwrap();
        assert_eq!(StateFile::new(&bad).get("x"), None);

        let list = dir.path().join("list.json");
        fs::write(&list, "[1, 2, 3]").unwrap();
        assert_eq!(StateFile::new(&list).get("x"), None);
    }

    #[test]
    fn test_set_creates_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("vars.json"));
        state.set("a", json!(99)).unwrap();
        assert_eq!(state.get("a"), Some(json!(99)));
        state.set("b", json!("x")).unwrap();
        state.set("a", json!(999)).unwrap();
        assert_eq!(state.get("a"), Some(json!(999)));
        assert_eq!(state.get("b"), Some(json!("x")));
    }

    #[test]
    fn test_set_overwrites_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars.json");
        fs::write(&path, "INVALID JSON").unwrap();
        let state = StateFile::new(&path);
        state.set("x", json!(42)).unwrap();
        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc, json!({"x": 42}));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_mode_watch() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join("state.json"));
        let watch = ModeWatch::new(state.clone());
        assert!(watch.should_stop());
        state.set_mode(MODE_REALTIME).unwrap();
        assert!(!watch.should_stop());
        state.set_mode("stop").unwrap();
        assert!(watch.should_stop());
    }
}
