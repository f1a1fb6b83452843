use std::path::{Path, PathBuf};

use crate::Result;

pub const CNC_FILE: &str = "cnc.dat";
pub const LOGS_DIR: &str = "logs";
const LOG_EXTENSION: &str = "logbuffer";

/// Paths inside a media driver directory.
///
/// ```text
/// {driver_dir}/
///   cnc.dat                       ← command-and-control file
///   logs/
///     00000001-0000000a.logbuffer ← one log buffer per (session, stream)
/// ```
#[derive(Debug, Clone)]
pub struct DriverLayout {
    root: PathBuf,
}

impl DriverLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default driver directory: `$CONDUIT_DIR`, else `/dev/shm/conduit-{user}`
    /// on Linux, else `{tmp}/conduit-{user}`.
    pub fn default_dir() -> Self {
        if let Ok(dir) = std::env::var("CONDUIT_DIR") {
            return Self::new(dir);
        }
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default".to_string());
        let name = format!("conduit-{user}");
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            Self::new(shm.join(name))
        } else {
            Self::new(std::env::temp_dir().join(name))
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cnc_path(&self) -> PathBuf {
        self.root.join(CNC_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn log_path(&self, session_id: u32, stream_id: u32) -> PathBuf {
        self.logs_dir()
            .join(format!("{session_id:08x}-{stream_id:08x}.{LOG_EXTENSION}"))
    }

    /// Path of a receive-side image log. Keyed by channel as well, since
    /// session ids are only unique per sending driver.
    pub fn image_path(&self, channel_key: u64, session_id: u32, stream_id: u32) -> PathBuf {
        self.logs_dir().join(format!(
            "image-{channel_key:016x}-{session_id:08x}-{stream_id:08x}.{LOG_EXTENSION}"
        ))
    }

    /// Create the directory tree if missing.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    /// Remove every file the driver owns. Used on cold driver start to clear
    /// remnants of a previous run.
    pub fn clean(&self) -> Result<()> {
        let logs = self.logs_dir();
        if logs.is_dir() {
            for entry in std::fs::read_dir(&logs)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(LOG_EXTENSION) {
                    std::fs::remove_file(path)?;
                }
            }
        }
        let cnc = self.cnc_path();
        if cnc.exists() {
            std::fs::remove_file(cnc)?;
        }
        Ok(())
    }
}
