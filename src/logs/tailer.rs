use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::broadcaster::LogBroadcaster;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Follows the newest `*.log` / `*.rpt` file in a directory and publishes new lines.
pub struct LogTailer {
    dir: PathBuf,
    logs: LogBroadcaster,
    current: Option<PathBuf>,
    offset: u64,
    partial: Vec<u8>,
    /// Read positions of files that are not the current one.
    offsets: HashMap<PathBuf, u64>,
    primed: bool,
}

impl LogTailer {
    pub fn new(dir: impl Into<PathBuf>, logs: LogBroadcaster) -> Self {
        Self {
            dir: dir.into(),
            logs,
            current: None,
            offset: 0,
            partial: Vec::new(),
            offsets: HashMap::new(),
            primed: false,
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        info!(dir = %self.dir.display(), "log tailer started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                self.poll().await;
            }
        })
    }

    /// One tick: switch to a newer file if one appeared, then read what was appended.
    ///
    /// Files already present on the first listing are followed from their end. A file that
    /// shows up later is read from its start. Switching back to a file resumes where it left off.
    pub async fn poll(&mut self) {
        if let Some(files) = log_files(&self.dir).await {
            if self.primed {
                self.offsets.retain(|p, _| files.iter().any(|f| &f.path == p));
            } else {
                for f in &files {
                    self.offsets.insert(f.path.clone(), f.len);
                }
                self.primed = true;
            }
            let latest = files.into_iter().max_by_key(|f| f.modified).map(|f| f.path);
            if let Some(latest) = latest {
                if self.current.as_ref() != Some(&latest) {
                    self.switch_to(latest);
                }
            }
        }
        if self.current.is_some() {
            if let Err(e) = self.read_appended().await {
                warn!(error = %e, "log tail read failed; reopening on next tick");
                self.park_current();
            }
        }
    }

    /// Remembers where the current file was left, unfinished line included.
    fn park_current(&mut self) {
        if let Some(prev) = self.current.take() {
            let resume = self.offset.saturating_sub(self.partial.len() as u64);
            self.offsets.insert(prev, resume);
        }
        self.partial.clear();
    }

    fn switch_to(&mut self, path: PathBuf) {
        self.park_current();
        let offset = self.offsets.remove(&path).unwrap_or(0);
        debug!(path = %path.display(), offset, "tailing log file");
        self.current = Some(path);
        self.offset = offset;
    }

    async fn read_appended(&mut self) -> std::io::Result<()> {
        let Some(path) = self.current.as_ref() else {
            return Ok(());
        };
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            debug!(path = %path.display(), "log file truncated");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut chunk).await?;
        self.offset += chunk.len() as u64;

        self.partial.extend_from_slice(&chunk);
        let mut start = 0;
        while let Some(pos) = self.partial[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let line = String::from_utf8_lossy(&self.partial[start..end]);
            self.logs.publish(line.trim_end_matches('\r'));
            start = end + 1;
        }
        self.partial.drain(..start);
        Ok(())
    }
}

struct LogFile {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

/// `*.log` / `*.rpt` files in `dir`; `None` if the directory cannot be read.
async fn log_files(dir: &Path) -> Option<Vec<LogFile>> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_log = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "log" || e == "rpt");
        if !is_log {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        files.push(LogFile {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: meta.len(),
        });
    }
    Some(files)
}
