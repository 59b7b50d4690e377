//! Transcript logging context.
//!
//! A transcript is one append-only file per node per day. It is opened at
//! process start, handed to the tracing subscriber as a `MakeWriter`, and
//! closed (flushed) before exit. Opening prunes files older than the
//! retention window.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clusterroll_common::{now, NodeName};

const PREFIX: &str = "clusterroll";
const EXTENSION: &str = "log";

/// File name of `node`'s transcript for `date`.
pub fn file_name(node: &NodeName, date: NaiveDate) -> String {
    format!(
        "{}-{}-{}.{}",
        PREFIX,
        node.as_str().to_ascii_lowercase(),
        date.format("%Y%m%d"),
        EXTENSION
    )
}

/// Date encoded in a transcript file name belonging to `node`.
fn file_date(node: &NodeName, name: &str) -> Option<NaiveDate> {
    let prefix = format!("{}-{}-", PREFIX, node.as_str().to_ascii_lowercase());
    let stamp = name
        .strip_prefix(&prefix)?
        .strip_suffix(&format!(".{}", EXTENSION))?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
}

/// Delete `node`'s transcripts older than `retention_days` before `today`.
pub fn prune(
    directory: &Path,
    node: &NodeName,
    today: NaiveDate,
    retention_days: u32,
) -> io::Result<Vec<PathBuf>> {
    let cutoff = today - Duration::days(i64::from(retention_days));
    let mut removed = Vec::new();

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(|n| file_date(node, n)) else {
            continue;
        };
        if date < cutoff {
            fs::remove_file(entry.path())?;
            removed.push(entry.path());
        }
    }
    removed.sort();
    Ok(removed)
}

/// An open transcript file.
#[derive(Debug, Clone)]
pub struct Transcript {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl Transcript {
    /// Open today's transcript for `node` under `directory`.
    pub fn open(directory: &Path, node: &NodeName, retention_days: u32) -> io::Result<Self> {
        fs::create_dir_all(directory)?;
        let today = now().date_naive();
        prune(directory, node, today, retention_days)?;

        let path = directory.join(file_name(node, today));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Location of the transcript file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush everything written so far.
    pub fn close(self) -> io::Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()
    }
}

/// Writer handed out per log event.
pub struct TranscriptWriter {
    file: Arc<Mutex<File>>,
}

impl Write for TranscriptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for Transcript {
    type Writer = TranscriptWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TranscriptWriter {
            file: self.file.clone(),
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. Console output is human-readable text,
/// the transcript gets one JSON object per line.
pub fn init_logging(
    level: &str,
    console: bool,
    transcript: Option<Transcript>,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(io::stderr)
    });
    let transcript_layer = transcript.map(|t| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(t)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(transcript_layer)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("clusterroll-logs-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_file_name_round_trip() {
        let node = NodeName::new("HV01");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let name = file_name(&node, date);
        assert_eq!(name, "clusterroll-hv01-20240229.log");
        assert_eq!(file_date(&node, &name), Some(date));
        assert_eq!(file_date(&NodeName::new("HV02"), &name), None);
        assert_eq!(file_date(&node, "notes.txt"), None);
    }

    #[test]
    fn test_prune_keeps_recent_and_foreign_files() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        let node = NodeName::new("HV01");
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();

        let old = dir.join(file_name(&node, today - Duration::days(40)));
        let recent = dir.join(file_name(&node, today - Duration::days(3)));
        let other = dir.join(file_name(&NodeName::new("HV02"), today - Duration::days(40)));
        for path in [&old, &recent, &other] {
            fs::write(path, b"x").unwrap();
        }

        let removed = prune(&dir, &node, today, 30).unwrap();
        assert_eq!(removed, vec![old.clone()]);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(other.exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_writer_appends_to_file() {
        let dir = temp_dir();
        let node = NodeName::new("HV01");
        let transcript = Transcript::open(&dir, &node, 30).unwrap();
        let path = transcript.path().to_path_buf();

        transcript.make_writer().write_all(b"first\n").unwrap();
        transcript.make_writer().write_all(b"second\n").unwrap();
        transcript.close().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "first\nsecond\n");
        fs::remove_dir_all(&dir).unwrap();
    }
}
