//! The staging root: the directory under which the target system is
//! assembled. Paths handed to a `StagingRoot` are target paths (`/etc/...`)
//! and always resolve inside the root.

use crate::RuntimeError;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingRoot {
    root: PathBuf,
}

impl StagingRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map a target path to its location under the root. `..` is rejected.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, RuntimeError> {
        let mut out = self.root.clone();
        for comp in Path::new(target).components() {
            match comp {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(c) => out.push(c),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(RuntimeError::PathEscape(target.to_owned()));
                }
            }
        }
        Ok(out)
    }

    pub fn ensure_exists(&self) -> Result<(), RuntimeError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn create_dir(&self, target: &str) -> Result<PathBuf, RuntimeError> {
        let path = self.resolve(target)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn exists(&self, target: &str) -> bool {
        self.resolve(target).is_ok_and(|p| p.exists())
    }

    /// Atomically write a file inside the target with the given mode.
    pub fn write_file(&self, target: &str, contents: &str, mode: u32) -> Result<(), RuntimeError> {
        let dest = self.resolve(target)?;
        let dir = dest
            .parent()
            .ok_or_else(|| RuntimeError::PathEscape(target.to_owned()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
        tmp.persist(&dest).map_err(|e| RuntimeError::Io(e.error))?;
        debug!("wrote {}", dest.display());
        Ok(())
    }

    pub fn read_file(&self, target: &str) -> Result<String, RuntimeError> {
        Ok(fs::read_to_string(self.resolve(target)?)?)
    }

    /// Create or replace a symlink at `link` pointing to `points_to`
    /// (interpreted inside the target, so usually absolute).
    pub fn symlink(&self, link: &str, points_to: &str) -> Result<(), RuntimeError> {
        let path = self.resolve(link)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.symlink_metadata().is_ok() {
            fs::remove_file(&path)?;
        }
        std::os::unix::fs::symlink(points_to, &path)?;
        Ok(())
    }

    fn aside_path(&self) -> PathBuf {
        let mut name = self.root.file_name().unwrap_or_default().to_os_string();
        name.push(".preseed");
        self.root.with_file_name(name)
    }

    /// Move files staged before the target filesystems are mounted out of
    /// the way, leaving an empty mount point. Returns where they went.
    pub fn set_aside(&self) -> Result<Option<PathBuf>, RuntimeError> {
        self.ensure_exists()?;
        if fs::read_dir(&self.root)?.next().is_none() {
            return Ok(None);
        }
        let aside = self.aside_path();
        if aside.exists() {
            fs::remove_dir_all(&aside)?;
        }
        fs::rename(&self.root, &aside)?;
        fs::create_dir_all(&self.root)?;
        debug!("pre-staged files moved to {}", aside.display());
        Ok(Some(aside))
    }

    /// Copy files set aside by [`Self::set_aside`] into the (now mounted)
    /// root and drop the temporary copy.
    pub fn adopt(&self, aside: &Path) -> Result<(), RuntimeError> {
        copy_tree(aside, &self.root)?;
        fs::remove_dir_all(aside)?;
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let ft = entry.file_type()?;
        if ft.is_dir() {
            copy_tree(&from, &to)?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to)?;
            }
            std::os::unix::fs::symlink(target, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_stays_inside_root() {
        let root = StagingRoot::new("/mnt/target");
        assert_eq!(
            root.resolve("/etc/hostname").unwrap(),
            Path::new("/mnt/target/etc/hostname")
        );
        assert_eq!(
            root.resolve("etc/./hosts").unwrap(),
            Path::new("/mnt/target/etc/hosts")
        );
        assert!(matches!(
            root.resolve("/etc/../../host"),
            Err(RuntimeError::PathEscape(_))
        ));
    }

    #[test]
    fn write_file_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let root = StagingRoot::new(dir.path());
        root.write_file("/root/secret", "x", 0o600).unwrap();
        let meta = fs::metadata(dir.path().join("root/secret")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(root.read_file("/root/secret").unwrap(), "x");
    }

    #[test]
    fn symlink_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = StagingRoot::new(dir.path());
        root.symlink("/etc/localtime", "/usr/share/zoneinfo/UTC")
            .unwrap();
        root.symlink("/etc/localtime", "/usr/share/zoneinfo/Europe/Rome")
            .unwrap();
        assert_eq!(
            fs::read_link(dir.path().join("etc/localtime")).unwrap(),
            Path::new("/usr/share/zoneinfo/Europe/Rome")
        );
    }

    #[test]
    fn set_aside_and_adopt_carry_files_over() {
        let dir = tempfile::tempdir().unwrap();
        let root = StagingRoot::new(dir.path().join("target"));
        root.write_file("/etc/hostname", "alp\n", 0o644).unwrap();
        root.symlink("/etc/localtime", "/usr/share/zoneinfo/UTC")
            .unwrap();

        let aside = root.set_aside().unwrap().unwrap();
        assert!(!root.exists("/etc/hostname"));
        assert!(aside.join("etc/hostname").exists());

        root.create_dir("/boot").unwrap();
        root.adopt(&aside).unwrap();
        assert_eq!(root.read_file("/etc/hostname").unwrap(), "alp\n");
        assert!(root.exists("/boot"));
        assert!(fs::symlink_metadata(root.resolve("/etc/localtime").unwrap())
            .unwrap()
            .file_type()
            .is_symlink());
        assert!(!aside.exists());
    }

    #[test]
    fn set_aside_on_empty_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let root = StagingRoot::new(dir.path().join("target"));
        assert!(root.set_aside().unwrap().is_none());
        assert!(root.path().exists());
    }
}
