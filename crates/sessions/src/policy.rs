//! Collaborator interfaces: caller identity, destination policy and path
//! resolution, with the static implementations the server ships.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ferry_protocol::Destination;
use ferry_transfer::validate_upload_path;
use serde::{Deserialize, Serialize};

use crate::SessionError;

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    pub id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_admin: true,
        }
    }

    /// Returns `true` if this caller may read or mutate a session of `owner`.
    pub fn can_access(&self, owner: &str) -> bool {
        self.is_admin || self.id == owner
    }
}

/// Decides whether a file may be uploaded to a destination.
///
/// Consulted when a session is created and again at finalize with the
/// actual assembled size.
pub trait DestinationPolicy: Send + Sync {
    /// Returns the rejection reason, if any.
    fn validate_upload(
        &self,
        filename: &str,
        size: u64,
        destination: &Destination,
    ) -> Result<(), String>;
}

/// Maps a destination to a local directory.
pub trait PathResolver: Send + Sync {
    /// Returns the directory the file should land in.
    ///
    /// Fails with [`SessionError::NotFound`] for unknown zones and
    /// [`SessionError::Forbidden`] for paths escaping the zone.
    fn resolve(&self, destination: &Destination) -> Result<PathBuf, SessionError>;
}

/// Size and extension rules loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticPolicy {
    /// Largest accepted file in bytes; `0` means unlimited.
    pub max_file_size: u64,
    /// If non-empty, only these extensions are accepted.
    pub allowed_extensions: Vec<String>,
    pub denied_extensions: Vec<String>,
}

impl DestinationPolicy for StaticPolicy {
    fn validate_upload(
        &self,
        filename: &str,
        size: u64,
        _destination: &Destination,
    ) -> Result<(), String> {
        if self.max_file_size > 0 && size > self.max_file_size {
            return Err(format!(
                "{filename} is {size} bytes, limit is {}",
                self.max_file_size
            ));
        }

        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let matches = |list: &[String]| {
            list.iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        };

        if matches(&self.denied_extensions) {
            return Err(format!("extension .{ext} is not allowed"));
        }
        if !self.allowed_extensions.is_empty() && !matches(&self.allowed_extensions) {
            return Err(format!("extension .{ext} is not in the allowed list"));
        }
        Ok(())
    }
}

/// Resolves `zone:/path` against a fixed map of zone roots.
#[derive(Debug, Clone, Default)]
pub struct ZoneResolver {
    zones: HashMap<String, PathBuf>,
}

impl ZoneResolver {
    pub fn new(zones: HashMap<String, PathBuf>) -> Self {
        Self { zones }
    }
}

impl PathResolver for ZoneResolver {
    fn resolve(&self, destination: &Destination) -> Result<PathBuf, SessionError> {
        let root = self
            .zones
            .get(&destination.zone)
            .ok_or(SessionError::NotFound)?;

        let rel = destination.path.trim_matches('/');
        if rel.is_empty() {
            return Ok(root.clone());
        }
        validate_upload_path(rel).map_err(|_| SessionError::Forbidden)?;
        Ok(root.join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> Destination {
        Destination::new("media", "")
    }

    #[test]
    fn caller_access() {
        assert!(Caller::user("alice").can_access("alice"));
        assert!(!Caller::user("bob").can_access("alice"));
        assert!(Caller::admin("root").can_access("alice"));
    }

    #[test]
    fn default_policy_accepts_everything() {
        let policy = StaticPolicy::default();
        assert!(policy.validate_upload("a.bin", u64::MAX, &dest()).is_ok());
    }

    #[test]
    fn policy_rejects_oversized() {
        let policy = StaticPolicy {
            max_file_size: 100,
            ..Default::default()
        };
        assert!(policy.validate_upload("a.bin", 100, &dest()).is_ok());
        assert!(policy.validate_upload("a.bin", 101, &dest()).is_err());
    }

    #[test]
    fn policy_extension_lists() {
        let policy = StaticPolicy {
            allowed_extensions: vec!["jpg".into(), ".PNG".into()],
            denied_extensions: vec!["exe".into()],
            ..Default::default()
        };
        assert!(policy.validate_upload("a.JPG", 1, &dest()).is_ok());
        assert!(policy.validate_upload("b.png", 1, &dest()).is_ok());
        assert!(policy.validate_upload("c.gif", 1, &dest()).is_err());
        assert!(policy.validate_upload("noext", 1, &dest()).is_err());

        let deny_only = StaticPolicy {
            denied_extensions: vec!["exe".into()],
            ..Default::default()
        };
        assert!(deny_only.validate_upload("setup.exe", 1, &dest()).is_err());
        assert!(deny_only.validate_upload("notes.txt", 1, &dest()).is_ok());
    }

    #[test]
    fn resolver_joins_zone_root() {
        let resolver = ZoneResolver::new(HashMap::from([(
            "media".to_string(),
            PathBuf::from("/srv/media"),
        )]));
        assert_eq!(
            resolver.resolve(&Destination::new("media", "")).unwrap(),
            PathBuf::from("/srv/media")
        );
        assert_eq!(
            resolver
                .resolve(&Destination::new("media", "/films/2024/"))
                .unwrap(),
            PathBuf::from("/srv/media/films/2024")
        );
    }

    #[test]
    fn resolver_errors() {
        let resolver = ZoneResolver::new(HashMap::from([(
            "media".to_string(),
            PathBuf::from("/srv/media"),
        )]));
        assert!(matches!(
            resolver.resolve(&Destination::new("backup", "")),
            Err(SessionError::NotFound)
        ));
        assert!(matches!(
            resolver.resolve(&Destination::new("media", "../etc")),
            Err(SessionError::Forbidden)
        ));
    }
}
