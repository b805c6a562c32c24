//! Project identity and per-project filesystem layout.
//!
//! A project is the working directory a session is launched from. Its
//! identity is a [`ProjectKey`]: the sanitized final path component plus a
//! short hash of the full normalized path, so two directories that share a
//! name still get distinct keys, and the key is safe to embed in container
//! and directory names.
//!
//! # Storage Layout
//!
//! Each project owns one directory under the data root:
//!
//! ```text
//! {data_root}/projects/{project-key}/
//! ├── data/            # persistent project state, mounted into sessions
//! ├── sessions.json    # session registry
//! └── sessions.lock    # advisory lock guarding registry mutations
//! ```

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RegistryError;

/// Directory permissions: owner read/write/execute only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Hex characters of the path hash kept in the key.
const KEY_HASH_LEN: usize = 8;

/// Longest sanitized name component kept in the key.
const KEY_NAME_MAX: usize = 32;

/// Stable identity of a project, derived from its working directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectKey(String);

impl ProjectKey {
    /// Derives the key for a normalized absolute workspace path.
    ///
    /// The caller is responsible for canonicalizing the path first; two
    /// spellings of the same directory must hash identically.
    #[must_use]
    pub fn derive(workspace: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(workspace.to_string_lossy().as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        let name = workspace
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project");

        Self(format!("{}-{}", sanitize(name), &digest[..KEY_HASH_LEN]))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reduces a directory name to lowercase ASCII alphanumerics and dashes.
fn sanitize(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= KEY_NAME_MAX {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug.to_string()
    }
}

/// Paths for a project's on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    /// Root directory for this project (`{data_root}/projects/{key}/`).
    pub root: PathBuf,
    /// Persistent project data, mounted read-write into every session.
    pub data_dir: PathBuf,
    /// Session registry JSON file.
    pub registry_file: PathBuf,
    /// Advisory lock file guarding registry mutations.
    pub lock_file: PathBuf,
}

impl ProjectPaths {
    /// Computes all paths for the given data root and key.
    ///
    /// This only computes the paths; it does not create any directories.
    /// Use `create_directories()` to actually create the structure.
    #[must_use]
    pub fn new(data_root: &Path, key: &ProjectKey) -> Self {
        let root = data_root.join("projects").join(key.as_str());
        Self {
            data_dir: root.join("data"),
            registry_file: root.join("sessions.json"),
            lock_file: root.join("sessions.lock"),
            root,
        }
    }

    /// Creates the project root and data directory with 0700 permissions.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::IoError` if directory creation fails.
    pub fn create_directories(&self) -> Result<(), RegistryError> {
        for dir in [&self.root, &self.data_dir] {
            fs::create_dir_all(dir).map_err(|e| RegistryError::IoError {
                context: format!("failed to create directory: {}", dir.display()),
                source: e,
            })?;

            let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
            fs::set_permissions(dir, permissions).map_err(|e| RegistryError::IoError {
                context: format!("failed to set permissions on: {}", dir.display()),
                source: e,
            })?;
        }

        Ok(())
    }

    /// Checks whether the project directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// Returns the default data root for project state.
///
/// Uses `XDG_DATA_HOME` if set, otherwise `~/.local/share/ssm`, with `/tmp`
/// as a last resort.
#[must_use]
pub fn default_data_root() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data).join("ssm");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/ssm");
    }

    PathBuf::from("/tmp/ssm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_key_stable() {
        let a = ProjectKey::derive(Path::new("/home/dev/projects/widget"));
        let b = ProjectKey::derive(Path::new("/home/dev/projects/widget"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_project_key_distinct_paths_same_name() {
        let a = ProjectKey::derive(Path::new("/home/dev/projects/widget"));
        let b = ProjectKey::derive(Path::new("/home/dev/other/widget"));
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("widget-"));
        assert!(b.as_str().starts_with("widget-"));
    }

    #[test]
    fn test_project_key_format() {
        let key = ProjectKey::derive(Path::new("/srv/My Cool_App"));
        // name sanitized, then 8 hex hash chars
        let (name, hash) = key.as_str().rsplit_once('-').expect("dash separator");
        assert_eq!(name, "my-cool-app");
        assert_eq!(hash.len(), KEY_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitize_degenerate_names() {
        assert_eq!(sanitize("___"), "project");
        assert_eq!(sanitize(""), "project");
        assert_eq!(sanitize("a--b"), "a-b");
        assert!(sanitize(&"x".repeat(100)).len() <= KEY_NAME_MAX);
    }

    #[test]
    fn test_project_paths_layout() {
        let key = ProjectKey::derive(Path::new("/home/dev/widget"));
        let paths = ProjectPaths::new(Path::new("/tmp/ssm-test"), &key);

        assert_eq!(
            paths.root,
            Path::new("/tmp/ssm-test/projects").join(key.as_str())
        );
        assert_eq!(paths.data_dir, paths.root.join("data"));
        assert_eq!(paths.registry_file, paths.root.join("sessions.json"));
        assert_eq!(paths.lock_file, paths.root.join("sessions.lock"));
    }

    #[test]
    fn test_project_paths_create() {
        let base = std::env::temp_dir()
            .join("ssm-test-project")
            .join(uuid::Uuid::new_v4().to_string());
        let key = ProjectKey::derive(Path::new("/home/dev/widget"));
        let paths = ProjectPaths::new(&base, &key);

        assert!(!paths.exists());
        paths
            .create_directories()
            .expect("failed to create directories");
        assert!(paths.exists());
        assert!(paths.data_dir.is_dir());

        let mode = fs::metadata(&paths.root)
            .expect("metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, DIR_PERMISSIONS);

        let _ = fs::remove_dir_all(&base);
    }
}
