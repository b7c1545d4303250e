//! Deterministic working file names

use std::fmt;
use std::path::{Path, PathBuf};

use super::object::Operation;

/// Role of a staged CSV file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Source,
    Target,
    Export,
    Status,
}

impl FileRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileRole::Source => "source",
            FileRole::Target => "target",
            FileRole::Export => "export",
            FileRole::Status => "status",
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory holding the staged files of one object set
pub fn object_set_dir(base: &Path, set_index: usize) -> PathBuf {
    base.join(format!("objectset-{set_index}"))
}

/// `<base>/objectset-<i>/<role>/<Entity>_<Operation>_<role>.csv`
pub fn working_file(
    base: &Path,
    set_index: usize,
    entity: &str,
    operation: Operation,
    role: FileRole,
) -> PathBuf {
    object_set_dir(base, set_index)
        .join(role.as_str())
        .join(format!("{entity}_{operation}_{role}.csv"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_file_is_deterministic() {
        let path = working_file(Path::new("/tmp/run"), 2, "Account", Operation::Upsert, FileRole::Target);
        assert_eq!(
            path,
            PathBuf::from("/tmp/run/objectset-2/target/Account_Upsert_target.csv")
        );
    }

    #[test]
    fn test_roles_do_not_collide() {
        let base = Path::new("w");
        let source = working_file(base, 1, "Contact", Operation::Delete, FileRole::Source);
        let status = working_file(base, 1, "Contact", Operation::Delete, FileRole::Status);
        assert_ne!(source, status);
    }
}
