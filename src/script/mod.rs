//! Script data model
//!
//! A script is a JSON file holding object definitions, either bare at the top
//! level or grouped into object sets:
//!
//! ```json
//! { "objects": [ ... ], "objectSets": [ { "objects": [ ... ] } ] }
//! ```
//!
//! Bare objects form an implicit first set. Sets are numbered from 1 in file
//! order; cross-references between objects are always resolved by entity name
//! within the owning set.

pub mod files;
pub mod object;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

pub use files::{FileRole, object_set_dir, working_file};
pub use object::{
    ExtraData, FieldMappingEntry, ObjectDefinition, ObjectStats, Operation, PendingLookup,
    ScriptObject,
};

/// Default script file name inside the script directory
pub const SCRIPT_FILE_NAME: &str = "export.json";

/// Script file layout
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptDefinition {
    pub objects: Vec<ObjectDefinition>,
    pub object_sets: Vec<ObjectSetDefinition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ObjectSetDefinition {
    pub objects: Vec<ObjectDefinition>,
}

/// A loaded script
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub object_sets: Vec<ObjectSet>,
}

/// An independently ordered and processed group of objects
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    /// 1-based position in the script
    pub index: usize,
    pub objects: Vec<ScriptObject>,
    /// Entity names, parents first
    pub update_objects_order: Vec<String>,
    /// Exact reverse of `update_objects_order`
    pub delete_objects_order: Vec<String>,
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
    pub excluded_objects: Vec<String>,
    working_dir: PathBuf,
}

impl Script {
    /// Load a script file and create the per-set working directories.
    ///
    /// # Arguments
    /// * `path` - Script file
    /// * `working_dir` - Root of the staged CSV files
    pub fn load(path: &Path, working_dir: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        info!("Loading script {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let script = Self::from_json_str(&content, working_dir)?;

        for set in &script.object_sets {
            set.create_dirs()?;
        }

        Ok(script)
    }

    /// Parse script JSON without touching the filesystem.
    pub fn from_json_str(content: &str, working_dir: &Path) -> Result<Self> {
        let definition: ScriptDefinition = serde_json::from_str(content)
            .map_err(|e| ConfigError::InvalidFormat(format!("script: {e}")))?;
        Self::from_definition(definition, working_dir)
    }

    /// Normalize a decoded script definition into object sets.
    pub fn from_definition(definition: ScriptDefinition, working_dir: &Path) -> Result<Self> {
        let mut groups = Vec::new();
        if !definition.objects.is_empty() {
            groups.push(definition.objects);
        }
        groups.extend(definition.object_sets.into_iter().map(|set| set.objects));

        let mut object_sets = Vec::new();
        for (position, objects) in groups.into_iter().enumerate() {
            // Skipped sets keep their number so later sets match the file
            let index = position + 1;
            let mut set = ObjectSet::new(index, working_dir);
            let mut seen = HashSet::new();

            for object_definition in objects {
                let object = ScriptObject::from_definition(object_definition, index)?;
                let name = object.name().to_string();

                if object.excluded {
                    debug!("Object set {}: {} is excluded", index, name);
                    set.excluded_objects.push(name);
                    continue;
                }
                if !seen.insert(name.clone()) {
                    warn!("Object set {}: duplicate object {} ignored", index, name);
                    continue;
                }
                set.objects.push(object);
            }

            if set.objects.is_empty() {
                warn!("Object set {} has no active objects and is skipped", index);
                continue;
            }
            object_sets.push(set);
        }

        Ok(Self { object_sets })
    }

    pub fn object_count(&self) -> usize {
        self.object_sets.iter().map(|set| set.objects.len()).sum()
    }
}

impl ObjectSet {
    pub fn new(index: usize, working_dir: &Path) -> Self {
        let dir = object_set_dir(working_dir, index);
        Self {
            index,
            source_dir: dir.join(FileRole::Source.as_str()),
            target_dir: dir.join(FileRole::Target.as_str()),
            working_dir: working_dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// Create the directories of every file role.
    pub fn create_dirs(&self) -> Result<()> {
        let dir = object_set_dir(&self.working_dir, self.index);
        for role in [FileRole::Source, FileRole::Target, FileRole::Export, FileRole::Status] {
            std::fs::create_dir_all(dir.join(role.as_str()))?;
        }
        Ok(())
    }

    /// Staged file path for an object of this set
    pub fn file_for(&self, object: &ScriptObject, role: FileRole) -> PathBuf {
        working_file(&self.working_dir, self.index, object.name(), object.operation, role)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.objects.iter().position(|o| o.name() == name)
    }

    pub fn object(&self, name: &str) -> Option<&ScriptObject> {
        self.objects.iter().find(|o| o.name() == name)
    }

    pub fn object_mut(&mut self, name: &str) -> Option<&mut ScriptObject> {
        self.objects.iter_mut().find(|o| o.name() == name)
    }

    /// Object names in declaration order
    pub fn names(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.name().to_string()).collect()
    }

    /// Whether an object other than `except` already targets `target_entity`
    pub fn targets_entity(&self, target_entity: &str, except: &str) -> bool {
        self.objects
            .iter()
            .any(|o| o.name() != except && o.target_name() == target_entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SCRIPT: &str = r#"{
        "objects": [
            { "query": "SELECT Id, Name FROM Account", "operation": "Upsert", "externalId": "Name" },
            { "query": "SELECT Id FROM Account", "operation": "Readonly" },
            { "query": "SELECT Id FROM Lead", "excluded": true }
        ],
        "objectSets": [
            { "objects": [ { "query": "SELECT Id, LastName FROM Contact", "operation": "Insert" } ] },
            { "objects": [] }
        ]
    }"#;

    #[test]
    fn test_bare_objects_form_first_set() {
        let script = Script::from_json_str(SCRIPT, Path::new("/tmp/w")).unwrap();
        assert_eq!(script.object_sets.len(), 2);

        let first = &script.object_sets[0];
        assert_eq!(first.index, 1);
        assert_eq!(first.names(), vec!["Account"]);
        assert_eq!(first.objects[0].operation, Operation::Upsert);
        assert_eq!(first.excluded_objects, vec!["Lead"]);

        let second = &script.object_sets[1];
        assert_eq!(second.index, 2);
        assert_eq!(second.names(), vec!["Contact"]);
        assert_eq!(second.objects[0].set_index, 2);
    }

    #[test]
    fn test_skipped_set_keeps_its_number() {
        let script = Script::from_json_str(
            r#"{"objectSets": [
                { "objects": [ { "query": "SELECT Id FROM Lead", "excluded": true } ] },
                { "objects": [ { "query": "SELECT Id, Name FROM Account", "operation": "Insert" } ] }
            ]}"#,
            Path::new("/tmp/w"),
        )
        .unwrap();

        assert_eq!(script.object_sets.len(), 1);
        let set = &script.object_sets[0];
        assert_eq!(set.index, 2);
        assert_eq!(set.objects[0].set_index, 2);
        assert_eq!(set.source_dir, Path::new("/tmp/w/objectset-2/source"));
    }

    #[test]
    fn test_load_creates_working_dirs() {
        let dir = TempDir::new().unwrap();
        let script_path = dir.path().join(SCRIPT_FILE_NAME);
        std::fs::write(&script_path, SCRIPT).unwrap();
        let working = dir.path().join(".datamove");

        let script = Script::load(&script_path, &working).unwrap();
        assert_eq!(script.object_count(), 2);
        assert!(working.join("objectset-1/source").is_dir());
        assert!(working.join("objectset-2/status").is_dir());
        assert_eq!(script.object_sets[0].source_dir, working.join("objectset-1/source"));
    }

    #[test]
    fn test_missing_script_file() {
        let err = Script::load(Path::new("/no/such/export.json"), Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Script::from_json_str("{ objects: ", Path::new("/tmp")).unwrap_err();
        assert_eq!(err.kind_name(), "config");
    }
}
