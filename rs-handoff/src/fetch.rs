//! Sources of candidate binaries for signal-driven upgrades.

use std::io;
use std::path::PathBuf;

/// Produces the path of a ready-to-install binary. Called off the event loop.
pub trait Fetcher: Send + Sync {
    fn fetch_candidate(&self) -> io::Result<PathBuf>;
}

impl<F> Fetcher for F
where
    F: Fn() -> io::Result<PathBuf> + Send + Sync,
{
    fn fetch_candidate(&self) -> io::Result<PathBuf> {
        self()
    }
}

/// A candidate dropped at a fixed path by a deploy step
#[derive(Debug, Clone)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Fetcher for StagedFile {
    fn fetch_candidate(&self) -> io::Result<PathBuf> {
        let meta = std::fs::metadata(&self.path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a regular file", self.path),
            ));
        }
        Ok(self.path.clone())
    }
}
