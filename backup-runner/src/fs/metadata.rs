//! Ownership and permissions of the finished artifact.

use nix::unistd::{Group, User};
use std::fs;
use std::path::Path;

/// Owner, group and mode applied to the artifact once it is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPermissions {
    /// User name; `None` keeps the current owner
    pub owner: Option<String>,

    /// Group name; `None` keeps the current group
    pub group: Option<String>,

    /// Unix mode bits
    pub mode: u32,
}

impl Default for ArtifactPermissions {
    fn default() -> Self {
        Self {
            owner: None,
            group: None,
            mode: 0o600,
        }
    }
}

impl ArtifactPermissions {
    fn resolve_uid(&self) -> std::io::Result<Option<u32>> {
        let Some(name) = &self.owner else {
            return Ok(None);
        };
        match User::from_name(name).map_err(std::io::Error::from)? {
            Some(user) => Ok(Some(user.uid.as_raw())),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown user {:?}", name),
            )),
        }
    }

    fn resolve_gid(&self) -> std::io::Result<Option<u32>> {
        let Some(name) = &self.group else {
            return Ok(None);
        };
        match Group::from_name(name).map_err(std::io::Error::from)? {
            Some(group) => Ok(Some(group.gid.as_raw())),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unknown group {:?}", name),
            )),
        }
    }

    /// Human-readable description for logs
    pub fn describe(&self) -> String {
        format!(
            "{}:{} {:o}",
            self.owner.as_deref().unwrap_or("-"),
            self.group.as_deref().unwrap_or("-"),
            self.mode
        )
    }

    /// Apply ownership first, then mode, so the mode is never widened for a
    /// moment under the old owner.
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let uid = self.resolve_uid()?;
        let gid = self.resolve_gid()?;
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::chown(path, uid, gid)?;
        }

        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mode_applied() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o644))?;

        let perms = ArtifactPermissions {
            mode: 0o640,
            ..Default::default()
        };
        perms.apply_to_path(temp_file.path())?;

        let mode = fs::metadata(temp_file.path())?.permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        Ok(())
    }

    #[test]
    fn test_current_owner_accepted() -> std::io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let me = User::from_uid(nix::unistd::getuid())
            .map_err(std::io::Error::from)?
            .map(|u| u.name);

        let perms = ArtifactPermissions {
            owner: me,
            ..Default::default()
        };
        perms.apply_to_path(temp_file.path())?;
        Ok(())
    }

    #[test]
    fn test_unknown_user_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        let perms = ArtifactPermissions {
            owner: Some("no-such-user-backup-runner".into()),
            ..Default::default()
        };
        let err = perms.apply_to_path(temp_file.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_describe() {
        let perms = ArtifactPermissions {
            owner: Some("backup".into()),
            group: None,
            mode: 0o600,
        };
        assert_eq!(perms.describe(), "backup:- 600");
    }
}
