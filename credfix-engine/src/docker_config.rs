//! Docker client configuration file (`config.json`)
//!
//! Reading never fails hard: a missing or malformed file is a state the
//! probes report on. Writes go through a plan (before/after/diff) and are
//! committed atomically, so the file is valid JSON after every repair.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::diff::line_diff;

/// What is on disk right now
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigState {
    Missing,
    Unreadable { error: String },
    Malformed { error: String },
    Parsed(Value),
}

impl ConfigState {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ConfigState::Parsed(value) => Some(value),
            _ => None,
        }
    }
}

/// Structured edit applied during a repair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum ConfigEdit {
    SetCredsStore { helper: String },
    RemoveCredsStore,
    /// Convert legacy string entries in `auths` to `{ "auth": ... }` objects
    MigrateStringAuths,
    /// Replace an unparsable file with an empty, valid config
    Reset,
}

#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error("{} is not valid JSON; only a reset can repair it", path.display())]
    Malformed { path: PathBuf },
    #[error("{} does not contain a JSON object", path.display())]
    NotAnObject { path: PathBuf },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigWriteError {
    pub fn suggestion(&self) -> String {
        match self {
            ConfigWriteError::Malformed { path } | ConfigWriteError::NotAnObject { path } => format!(
                "Repair {} first (the reset fix backs it up), then retry",
                path.display()
            ),
            ConfigWriteError::Io { path, .. } => format!(
                "Check ownership and permissions of {} and its directory",
                path.display()
            ),
            ConfigWriteError::Json(_) => "Report this as a bug; the generated config was not serializable".to_string(),
        }
    }
}

/// A computed but not yet committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedWrite {
    pub path: PathBuf,
    pub before: Option<String>,
    pub after: String,
    pub diff: String,
    pub changed: bool,
}

/// Structural findings on a parsed config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Registries whose `auths` entry is a bare string
    pub string_auths: Vec<String>,
    pub auths_is_string: bool,
}

#[derive(Debug, Clone)]
pub struct DockerConfigFile {
    path: PathBuf,
}

impl DockerConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ConfigState {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => ConfigState::Parsed(value),
                Err(e) => ConfigState::Malformed { error: e.to_string() },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigState::Missing,
            Err(e) => ConfigState::Unreadable { error: e.to_string() },
        }
    }

    /// Compute the result of `edit` without touching the file
    pub fn plan(&self, edit: &ConfigEdit) -> Result<PlannedWrite, ConfigWriteError> {
        let before = match std::fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ConfigWriteError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let current = match (&before, edit) {
            (_, ConfigEdit::Reset) => None,
            (None, _) => None,
            (Some(raw), _) => Some(serde_json::from_str::<Value>(raw).map_err(|_| {
                ConfigWriteError::Malformed {
                    path: self.path.clone(),
                }
            })?),
        };

        let updated = apply_edit(current, edit).ok_or_else(|| ConfigWriteError::NotAnObject {
            path: self.path.clone(),
        })?;
        let after = to_docker_json(&updated)?;
        let label = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config.json".to_string());
        let diff = line_diff(&label, before.as_deref(), &after);
        let changed = before.as_deref() != Some(after.as_str());

        Ok(PlannedWrite {
            path: self.path.clone(),
            before,
            after,
            diff,
            changed,
        })
    }

    /// Write a planned change atomically (temp file + rename)
    pub fn commit(&self, plan: &PlannedWrite) -> Result<(), ConfigWriteError> {
        if !plan.changed {
            debug!("No change to write for {}", self.path.display());
            return Ok(());
        }
        // Never write something that would not parse back
        serde_json::from_str::<Value>(&plan.after)?;

        let io_err = |source| ConfigWriteError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = self.path.with_extension(format!("json.credfix-{}.tmp", std::process::id()));
        std::fs::write(&tmp, plan.after.as_bytes()).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&self.path)
                .map(|m| m.permissions().mode())
                .unwrap_or(0o600);
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).map_err(io_err)?;
        }

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        info!("Wrote {}", self.path.display());
        Ok(())
    }
}

fn apply_edit(current: Option<Value>, edit: &ConfigEdit) -> Option<Value> {
    let mut root = match current {
        Some(Value::Object(map)) => map,
        Some(_) => return None,
        None => {
            let mut map = Map::new();
            map.insert("auths".to_string(), Value::Object(Map::new()));
            map
        }
    };

    match edit {
        ConfigEdit::SetCredsStore { helper } => {
            root.insert("credsStore".to_string(), Value::String(helper.clone()));
        }
        ConfigEdit::RemoveCredsStore => {
            root.remove("credsStore");
        }
        ConfigEdit::MigrateStringAuths => match root.get_mut("auths") {
            Some(Value::Object(auths)) => {
                for entry in auths.values_mut() {
                    if let Value::String(encoded) = entry {
                        let mut object = Map::new();
                        object.insert("auth".to_string(), Value::String(encoded.clone()));
                        *entry = Value::Object(object);
                    }
                }
            }
            Some(_) => {
                root.insert("auths".to_string(), Value::Object(Map::new()));
            }
            None => {}
        },
        ConfigEdit::Reset => {}
    }

    Some(Value::Object(root))
}

/// Serialize the way the Docker CLI does (tab indentation)
pub fn to_docker_json(value: &Value) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

pub fn creds_store(value: &Value) -> Option<&str> {
    value.get("credsStore").and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub fn cred_helpers(value: &Value) -> BTreeMap<String, String> {
    value
        .get("credHelpers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(registry, helper)| {
                    helper.as_str().map(|h| (registry.clone(), h.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn validate(value: &Value) -> ConfigValidation {
    let mut validation = ConfigValidation::default();

    let Some(root) = value.as_object() else {
        validation.errors.push("config root is not a JSON object".to_string());
        return validation;
    };

    match root.get("auths") {
        None => validation
            .warnings
            .push("no `auths` key; it is created on the next `docker login`".to_string()),
        Some(Value::String(_)) => {
            validation.auths_is_string = true;
            validation
                .errors
                .push("`auths` is a string (deprecated format); expected an object".to_string());
        }
        Some(Value::Object(entries)) => {
            for (registry, entry) in entries {
                if entry.is_string() {
                    validation.string_auths.push(registry.clone());
                } else if !entry.is_object() {
                    validation
                        .errors
                        .push(format!("`auths.{registry}` is neither an object nor a string"));
                }
            }
            if !validation.string_auths.is_empty() {
                validation.warnings.push(format!(
                    "deprecated string-typed auth entries: {}",
                    validation.string_auths.join(", ")
                ));
            }
        }
        Some(_) => validation
            .errors
            .push("`auths` must be an object".to_string()),
    }

    match root.get("credsStore") {
        None | Some(Value::String(_)) => {}
        Some(_) => validation.errors.push("`credsStore` must be a string".to_string()),
    }

    match root.get("credHelpers") {
        None | Some(Value::Object(_)) => {}
        Some(_) => validation.errors.push("`credHelpers` must be an object".to_string()),
    }

    validation
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &tempfile::TempDir, content: &str) -> DockerConfigFile {
        let path = dir.path().join("config.json");
        std::fs::write(&path, content).unwrap();
        DockerConfigFile::new(path)
    }

    #[test]
    fn test_load_states() {
        let dir = tempfile::tempdir().unwrap();
        let missing = DockerConfigFile::new(dir.path().join("config.json"));
        assert_eq!(missing.load(), ConfigState::Missing);

        let malformed = write(&dir, "{ \"auths\": ");
        assert!(matches!(malformed.load(), ConfigState::Malformed { .. }));

        let parsed = write(&dir, r#"{"credsStore": "pass"}"#);
        let state = parsed.load();
        assert_eq!(creds_store(state.value().unwrap()), Some("pass"));
    }

    #[test]
    fn test_validation_flags_deprecated_and_missing_auths() {
        let v = validate(&json!({"credsStore": "pass"}));
        assert!(v.errors.is_empty());
        assert_eq!(v.warnings.len(), 1);

        let v = validate(&json!({"auths": {"registry.example.com": "dXNlcjpwYXNz"}}));
        assert!(v.errors.is_empty());
        assert_eq!(v.string_auths, vec!["registry.example.com".to_string()]);

        let v = validate(&json!({"auths": "legacy"}));
        assert!(v.auths_is_string);
        assert_eq!(v.errors.len(), 1);

        let v = validate(&json!({"auths": {}, "credsStore": 3}));
        assert_eq!(v.errors, vec!["`credsStore` must be a string".to_string()]);
    }

    #[test]
    fn test_plan_does_not_touch_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "{\n\t\"auths\": {},\n\t\"credsStore\": \"secretservice\"\n}");
        let before = std::fs::read(file.path()).unwrap();

        let plan = file.plan(&ConfigEdit::SetCredsStore { helper: "pass".into() }).unwrap();
        assert!(plan.changed);
        assert!(plan.diff.contains("+\t\"credsStore\": \"pass\""));
        assert_eq!(std::fs::read(file.path()).unwrap(), before);
    }

    #[test]
    fn test_commit_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = DockerConfigFile::new(dir.path().join(".docker").join("config.json"));
        let plan = file.plan(&ConfigEdit::SetCredsStore { helper: "pass".into() }).unwrap();
        assert!(plan.before.is_none());
        file.commit(&plan).unwrap();

        let state = file.load();
        let value = state.value().unwrap();
        assert_eq!(creds_store(value), Some("pass"));
        assert!(value.get("auths").unwrap().is_object());
    }

    #[test]
    fn test_migrate_string_auths() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, r#"{"auths": {"ghcr.io": "abc", "docker.io": {"auth": "def"}}}"#);
        let plan = file.plan(&ConfigEdit::MigrateStringAuths).unwrap();
        file.commit(&plan).unwrap();
        let state = file.load();
        let value = state.value().unwrap();
        assert_eq!(value["auths"]["ghcr.io"], json!({"auth": "abc"}));
        assert_eq!(value["auths"]["docker.io"], json!({"auth": "def"}));
        assert!(validate(value).string_auths.is_empty());
    }

    #[test]
    fn test_malformed_requires_reset() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(&dir, "not json");
        assert!(matches!(
            file.plan(&ConfigEdit::RemoveCredsStore),
            Err(ConfigWriteError::Malformed { .. })
        ));

        let plan = file.plan(&ConfigEdit::Reset).unwrap();
        file.commit(&plan).unwrap();
        assert_eq!(file.load(), ConfigState::Parsed(json!({"auths": {}})));
    }

    #[test]
    fn test_cred_helpers() {
        let helpers = cred_helpers(&json!({"credHelpers": {"gcr.io": "gcloud", "bad": 1}}));
        assert_eq!(helpers.len(), 1);
        assert_eq!(helpers.get("gcr.io").map(String::as_str), Some("gcloud"));
    }
}
