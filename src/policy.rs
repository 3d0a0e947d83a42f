//! Capability policy: declarative grants attached to an isolation domain.
//!
//! A `CapabilitySet` is built once, validated, and handed to a domain
//! behind an `Arc`. It has no mutating API: "adding" a grant means
//! building a new set through `CapabilityPolicy::from_set`, which
//! leaves every existing holder untouched.
//!
//! Capabilities are declared here, not enforced at the instruction
//! level. The domain checks them at its loading boundary only.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// Opaque identity of a trusted code unit (stands in for a strong name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken {
    pub name: String,
    pub version: String,
    /// Lowercase hex SHA-1 of `name@version`
    pub key: String,
}

impl IdentityToken {
    pub fn new(name: &str, version: &str) -> Self {
        let digest = Sha1::digest(format!("{name}@{version}").as_bytes());
        Self {
            name: name.to_string(),
            version: version.to_string(),
            key: hex::encode(digest),
        }
    }

    /// Identity of this host binary.
    pub fn host() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    fn is_well_formed(&self) -> bool {
        !self.name.is_empty()
            && !self.version.is_empty()
            && self.key.len() == 40
            && self.key.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// A single declarative grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grant {
    Execute,
    ReadFile(PathBuf),
    DiscoverPath(PathBuf),
    WindowAccess,
    ClipboardAccess,
    TrustedIdentity(IdentityToken),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("empty path in {0} grant")]
    EmptyPath(&'static str),
    #[error("read grant target does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("read grant target is not a file: {0}")]
    NotAFile(PathBuf),
    #[error("discovery grant target does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("discovery grant target is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("malformed identity token for {0:?}")]
    MalformedIdentity(String),
}

/// Immutable, ordered set of grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    grants: Vec<Grant>,
}

impl CapabilitySet {
    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn permits_execute(&self) -> bool {
        self.grants.contains(&Grant::Execute)
    }

    /// Read access is granted per exact file, never per directory.
    pub fn permits_read(&self, path: &Path) -> bool {
        let Ok(path) = path.canonicalize() else {
            return false;
        };
        self.grants
            .iter()
            .any(|g| matches!(g, Grant::ReadFile(p) if *p == path))
    }

    /// Discovery covers the granted directory and everything below it.
    pub fn permits_discovery(&self, dir: &Path) -> bool {
        let Ok(dir) = dir.canonicalize() else {
            return false;
        };
        self.grants
            .iter()
            .any(|g| matches!(g, Grant::DiscoverPath(p) if dir.starts_with(p)))
    }

    pub fn trusts(&self, token: &IdentityToken) -> bool {
        self.grants.contains(&Grant::TrustedIdentity(token.clone()))
    }

    /// Short form for log lines, e.g. `execute, read(/x/y.toml), ui-window`
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        self.grants
            .iter()
            .map(|g| match g {
                Grant::Execute => "execute".to_string(),
                Grant::ReadFile(p) => format!("read({})", p.display()),
                Grant::DiscoverPath(p) => format!("discover({})", p.display()),
                Grant::WindowAccess => "ui-window".to_string(),
                Grant::ClipboardAccess => "ui-clipboard".to_string(),
                Grant::TrustedIdentity(t) => format!("trust({}@{})", t.name, t.version),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builds validated `CapabilitySet`s.
#[derive(Debug, Default)]
pub struct CapabilityPolicy {
    grants: Vec<Grant>,
}

impl CapabilityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new policy seeded with the grants of an existing set.
    /// The existing set is not modified.
    pub fn from_set(set: &CapabilitySet) -> Self {
        Self {
            grants: set.grants().to_vec(),
        }
    }

    pub fn grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }

    pub fn build(self) -> Result<CapabilitySet, ConfigurationError> {
        Self::construct(self.grants)
    }

    /// Validates and normalizes grants into an immutable set.
    ///
    /// Paths are canonicalized; exact duplicates are dropped, keeping the
    /// first occurrence. Whether the grants suffice to run a module is not
    /// checked here.
    pub fn construct(
        grants: impl IntoIterator<Item = Grant>,
    ) -> Result<CapabilitySet, ConfigurationError> {
        let mut out: Vec<Grant> = Vec::new();
        for grant in grants {
            let grant = normalize(grant)?;
            if !out.contains(&grant) {
                out.push(grant);
            }
        }
        Ok(CapabilitySet { grants: out })
    }
}

fn normalize(grant: Grant) -> Result<Grant, ConfigurationError> {
    match grant {
        Grant::ReadFile(path) => {
            if path.as_os_str().is_empty() {
                return Err(ConfigurationError::EmptyPath("read"));
            }
            let canonical = path
                .canonicalize()
                .map_err(|_| ConfigurationError::MissingFile(path.clone()))?;
            if !canonical.is_file() {
                return Err(ConfigurationError::NotAFile(path));
            }
            Ok(Grant::ReadFile(canonical))
        }
        Grant::DiscoverPath(dir) => {
            if dir.as_os_str().is_empty() {
                return Err(ConfigurationError::EmptyPath("discover"));
            }
            let canonical = dir
                .canonicalize()
                .map_err(|_| ConfigurationError::MissingDirectory(dir.clone()))?;
            if !canonical.is_dir() {
                return Err(ConfigurationError::NotADirectory(dir));
            }
            Ok(Grant::DiscoverPath(canonical))
        }
        Grant::TrustedIdentity(token) => {
            if !token.is_well_formed() {
                return Err(ConfigurationError::MalformedIdentity(token.name));
            }
            Ok(Grant::TrustedIdentity(token))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plugin.toml");
        std::fs::write(&file, "entry = \"buggy-plugin\"\n").unwrap();
        (dir, file)
    }

    #[test]
    fn test_construct_preserves_order() {
        let (dir, file) = fixture();
        let set = CapabilityPolicy::construct(vec![
            Grant::Execute,
            Grant::ReadFile(file.clone()),
            Grant::DiscoverPath(dir.path().to_path_buf()),
            Grant::WindowAccess,
        ])
        .unwrap();

        assert_eq!(set.len(), 4);
        assert_eq!(set.grants()[0], Grant::Execute);
        assert!(matches!(set.grants()[1], Grant::ReadFile(_)));
        assert!(matches!(set.grants()[2], Grant::DiscoverPath(_)));
        assert_eq!(set.grants()[3], Grant::WindowAccess);
    }

    #[test]
    fn test_construct_drops_duplicates() {
        let set = CapabilityPolicy::construct(vec![
            Grant::Execute,
            Grant::ClipboardAccess,
            Grant::Execute,
        ])
        .unwrap();
        assert_eq!(set.grants(), &[Grant::Execute, Grant::ClipboardAccess]);
    }

    #[test]
    fn test_construct_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CapabilityPolicy::construct(vec![Grant::ReadFile(dir.path().join("nope"))])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingFile(_)));
    }

    #[test]
    fn test_construct_rejects_directory_as_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CapabilityPolicy::construct(vec![Grant::ReadFile(dir.path().to_path_buf())])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::NotAFile(_)));
    }

    #[test]
    fn test_construct_rejects_file_as_directory() {
        let (_dir, file) = fixture();
        let err = CapabilityPolicy::construct(vec![Grant::DiscoverPath(file)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::NotADirectory(_)));
    }

    #[test]
    fn test_construct_rejects_empty_path() {
        let err = CapabilityPolicy::construct(vec![Grant::DiscoverPath(PathBuf::new())])
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyPath("discover")));
    }

    #[test]
    fn test_construct_rejects_malformed_identity() {
        let mut token = IdentityToken::host();
        token.key = "not-hex".to_string();
        let err = CapabilityPolicy::construct(vec![Grant::TrustedIdentity(token)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::MalformedIdentity(_)));
    }

    #[test]
    fn test_permits_read_is_exact() {
        let (dir, file) = fixture();
        let other = dir.path().join("other.toml");
        std::fs::write(&other, "").unwrap();

        let set = CapabilityPolicy::new()
            .grant(Grant::ReadFile(file.clone()))
            .build()
            .unwrap();
        assert!(set.permits_read(&file));
        assert!(!set.permits_read(&other));
        assert!(!set.permits_read(dir.path()));
    }

    #[test]
    fn test_permits_discovery_covers_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("plugins");
        std::fs::create_dir(&sub).unwrap();

        let set = CapabilityPolicy::new()
            .grant(Grant::DiscoverPath(dir.path().to_path_buf()))
            .build()
            .unwrap();
        assert!(set.permits_discovery(dir.path()));
        assert!(set.permits_discovery(&sub));
        assert!(!set.permits_discovery(dir.path().parent().unwrap()));
    }

    #[test]
    fn test_from_set_leaves_original_untouched() {
        let original = CapabilityPolicy::new().grant(Grant::Execute).build().unwrap();
        let snapshot = original.clone();

        let widened = CapabilityPolicy::from_set(&original)
            .grant(Grant::ClipboardAccess)
            .build()
            .unwrap();

        assert_eq!(original, snapshot);
        assert_eq!(widened.len(), 2);
        assert_eq!(original.len(), 1);
    }

    #[test]
    fn test_identity_token_key() {
        let token = IdentityToken::new("sandbox-host", "0.1.0");
        assert_eq!(token.key.len(), 40);
        assert_eq!(token, IdentityToken::new("sandbox-host", "0.1.0"));
        assert_ne!(token.key, IdentityToken::new("sandbox-host", "0.2.0").key);

        let set = CapabilityPolicy::new()
            .grant(Grant::TrustedIdentity(token.clone()))
            .build()
            .unwrap();
        assert!(set.trusts(&token));
        assert!(!set.trusts(&IdentityToken::new("other", "1.0.0")));
    }

    #[test]
    fn test_summary() {
        let set = CapabilityPolicy::construct(vec![Grant::Execute, Grant::WindowAccess]).unwrap();
        assert_eq!(set.summary(), "execute, ui-window");
        assert_eq!(CapabilityPolicy::construct(vec![]).unwrap().summary(), "none");
    }
}
