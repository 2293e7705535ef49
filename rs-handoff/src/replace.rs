//! Atomic installation of a candidate binary over the running executable.
//!
//! The candidate is copied into a sibling temporary file, synced, and then
//! renamed over the binary path. Readers opening the binary path see either
//! the old inode or the new one, never a partially written file. Replacers
//! (including sibling supervisors sharing the binary) are serialized by a
//! `FileLock` on `<binary>.lock`.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::ReplaceError;
use crate::lock::{FileLock, LockMode};

pub const LOCK_SUFFIX: &str = ".lock";

const DEFAULT_MODE: u32 = 0o755;

pub fn lock_path_for(binary_path: &Path) -> PathBuf {
    let mut name = OsString::from(binary_path.as_os_str());
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct BinaryReplacer {
    binary_path: PathBuf,
    lock: FileLock,
}

impl BinaryReplacer {
    pub fn new<P: Into<PathBuf>>(binary_path: P) -> Self {
        let binary_path = binary_path.into();
        let lock = FileLock::new(lock_path_for(&binary_path));
        Self { binary_path, lock }
    }

    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock = self.lock.with_mode(mode);
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Install `candidate` as the binary. On error the binary is untouched.
    pub fn replace(&self, candidate: &Path) -> Result<(), ReplaceError> {
        let token = self.lock.acquire()?;
        debug!("acquired {:?}", token.path());

        let temp_path = self.temp_path()?;
        let result = self.install(candidate, &temp_path);
        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove {:?}: {}", temp_path, e);
                }
            }
        }

        // dropping also unlocks; an explicit release surfaces the errno
        if let Err(e) = token.release() {
            warn!("releasing binary lock: {}", e);
        }

        if result.is_ok() {
            info!("installed {:?} as {:?}", candidate, self.binary_path);
        }
        result
    }

    fn install(&self, candidate: &Path, temp_path: &Path) -> Result<(), ReplaceError> {
        let mut source = File::open(candidate).map_err(|source| ReplaceError::Candidate {
            path: candidate.to_path_buf(),
            source,
        })?;

        let mut temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(temp_path)
            .map_err(io_err("create", temp_path))?;

        io::copy(&mut source, &mut temp).map_err(io_err("copy", temp_path))?;

        temp.set_permissions(self.install_permissions())
            .map_err(io_err("chmod", temp_path))?;
        temp.sync_all().map_err(io_err("sync", temp_path))?;
        drop(temp);

        fs::rename(temp_path, &self.binary_path).map_err(io_err("rename", &self.binary_path))?;

        // persist the directory entry swap
        let dir = self.directory()?;
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(io_err("sync", dir))?;
        Ok(())
    }

    fn install_permissions(&self) -> Permissions {
        let mode = match fs::metadata(&self.binary_path) {
            Ok(meta) => meta.permissions().mode() & 0o7777,
            Err(_) => DEFAULT_MODE,
        };
        Permissions::from_mode(mode)
    }

    fn directory(&self) -> Result<&Path, ReplaceError> {
        match self.binary_path.parent() {
            Some(dir) if dir.as_os_str().is_empty() => Ok(Path::new(".")),
            Some(dir) => Ok(dir),
            None => Err(ReplaceError::NoParent {
                path: self.binary_path.clone(),
            }),
        }
    }

    fn temp_path(&self) -> Result<PathBuf, ReplaceError> {
        let dir = self.directory()?;
        let name = self
            .binary_path
            .file_name()
            .ok_or_else(|| ReplaceError::NoParent {
                path: self.binary_path.clone(),
            })?;
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let mut temp = OsString::from(".");
        temp.push(name);
        temp.push(format!(".{suffix}.tmp"));
        Ok(dir.join(temp))
    }
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> ReplaceError + 'a {
    move |source| ReplaceError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Compares two files byte for byte. Any read error counts as a difference.
pub fn same_contents(a: &Path, b: &Path) -> bool {
    fn compare(a: &Path, b: &Path) -> io::Result<bool> {
        let (fa, fb) = (File::open(a)?, File::open(b)?);
        if fa.metadata()?.len() != fb.metadata()?.len() {
            return Ok(false);
        }
        let (mut ra, mut rb) = (BufReader::new(fa), BufReader::new(fb));
        let (mut ba, mut bb) = ([0u8; 8192], [0u8; 8192]);
        loop {
            let n = ra.read(&mut ba)?;
            if n == 0 {
                return Ok(true);
            }
            rb.read_exact(&mut bb[..n])?;
            if ba[..n] != bb[..n] {
                return Ok(false);
            }
        }
    }
    compare(a, b).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/opt/app/server")),
            PathBuf::from("/opt/app/server.lock")
        );
    }

    #[test]
    fn keeps_original_mode() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write(dir.path(), "server", "v1");
        fs::set_permissions(&bin, Permissions::from_mode(0o750)).unwrap();
        let candidate = write(dir.path(), "candidate", "v2");

        BinaryReplacer::new(&bin).replace(&candidate).unwrap();

        let mode = fs::metadata(&bin).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
        assert_eq!(fs::read_to_string(&bin).unwrap(), "v2");
    }

    #[test]
    fn missing_binary_is_installed_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("server");
        let candidate = write(dir.path(), "candidate", "v1");

        BinaryReplacer::new(&bin).replace(&candidate).unwrap();

        let mode = fs::metadata(&bin).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, DEFAULT_MODE);
    }

    #[test]
    fn failure_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write(dir.path(), "server", "v1");
        let replacer = BinaryReplacer::new(&bin);

        let err = replacer
            .replace(&dir.path().join("does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, ReplaceError::Candidate { .. }));

        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["server", "server.lock"]);
    }

    #[test]
    fn directory_candidate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write(dir.path(), "server", "v1");
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        assert!(BinaryReplacer::new(&bin).replace(&sub).is_err());
        assert_eq!(fs::read_to_string(&bin).unwrap(), "v1");
    }

    #[test]
    fn contended_lock_is_reported_without_touching_binary() {
        let dir = tempfile::tempdir().unwrap();
        let bin = write(dir.path(), "server", "v1");
        let candidate = write(dir.path(), "candidate", "v2");
        let replacer = BinaryReplacer::new(&bin).with_lock_mode(LockMode::NonBlocking);

        let _held = FileLock::new(replacer.lock_path()).acquire().unwrap();
        let err = replacer.replace(&candidate).unwrap_err();
        assert!(matches!(
            err,
            ReplaceError::Lock(crate::error::LockError::Contended { .. })
        ));
        assert_eq!(fs::read_to_string(&bin).unwrap(), "v1");
    }

    #[test]
    fn compares_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a", "same bytes");
        let b = write(dir.path(), "b", "same bytes");
        let c = write(dir.path(), "c", "same bytez");
        assert!(same_contents(&a, &b));
        assert!(!same_contents(&a, &c));
        assert!(!same_contents(&a, &dir.path().join("missing")));
    }
}
