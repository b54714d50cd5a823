//! po-logging: NDJSON lifecycle events, the completion log and the run manifest.
//!
//! Human-readable diagnostics go to stderr; everything here is machine-readable and
//! append-only so a batch driver can tail it while the advisor runs.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run manifest schema version.
pub const RUN_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Written once at startup next to the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestV1 {
    pub run_manifest_version: u32,
    pub run_id: String,
    pub created_ts_ms: u64,

    pub protocol_version: u32,
    pub advisor_version: String,
    pub target: String,
    pub transport_mode: String,
    pub encoding: String,
    pub state_size: usize,
    pub action_space_size: usize,

    pub checkpoint: String,
    pub export_path: Option<String>,

    pub git_hash: Option<String>,
    pub config_hash: Option<String>,
}

pub fn now_ms() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_millis() as u64
}

pub fn hash_config_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn try_git_hash() -> Option<String> {
    use std::process::Command;

    let out = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8(out.stdout).ok()?;
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn read_manifest(path: impl AsRef<Path>) -> Result<RunManifestV1, NdjsonError> {
    let f = File::open(path)?;
    Ok(serde_json::from_reader(io::BufReader::new(f))?)
}

pub fn write_manifest_atomic(path: impl AsRef<Path>, m: &RunManifestV1) -> Result<(), NdjsonError> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(m)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Emitted when an episode leaves the session store.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub session: u64,
    pub unit: Option<String>,
    pub steps: u32,
    pub cumulative_reward: f64,
    pub actions: Vec<u32>,
    pub aborted: bool,
    pub error: Option<String>,
}

/// Transport-level happenings: startup, peer connect/disconnect, export result.
#[derive(Debug, Clone, Serialize)]
pub struct ServeEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub mode: &'static str,
    pub session: Option<u64>,
    pub detail: Option<String>,
}

impl ServeEventV1 {
    pub fn new(event: &'static str, mode: &'static str) -> Self {
        Self {
            event,
            ts_ms: now_ms(),
            mode,
            session: None,
            detail: None,
        }
    }

    pub fn session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Event log sink: one JSON object per line, appended.
pub struct NdjsonWriter {
    w: BufWriter<File>,
    lines_since_flush: u64,
    flush_every_lines: u64,
}

impl NdjsonWriter {
    /// With `flush_every_lines == 0` lines are only flushed on [`NdjsonWriter::flush`] or drop.
    pub fn open_append(path: impl AsRef<Path>, flush_every_lines: u64) -> Result<Self, NdjsonError> {
        let f = open_append_file(path.as_ref())?;
        Ok(Self {
            w: BufWriter::new(f),
            lines_since_flush: 0,
            flush_every_lines,
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        serde_json::to_writer(&mut self.w, event)?;
        self.w.write_all(b"\n")?;
        self.lines_since_flush += 1;
        if self.flush_every_lines > 0 && self.lines_since_flush >= self.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        self.lines_since_flush = 0;
        Ok(())
    }
}

/// One line per completed compilation unit, flushed immediately so an external batch driver
/// can track progress.
pub struct CompletionLog {
    f: File,
    path: PathBuf,
}

impl CompletionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        let path = path.as_ref().to_path_buf();
        let f = open_append_file(&path)?;
        Ok(Self { f, path })
    }

    pub fn append(&mut self, unit: &str) -> Result<(), NdjsonError> {
        // A unit id with an embedded newline would break the one-line-per-unit contract.
        let line = unit.replace(['\n', '\r'], " ");
        self.f.write_all(format!("{line}\n").as_bytes())?;
        self.f.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Thread-safe sink shared by every session: completion log + optional event log.
pub struct Journal {
    completions: Mutex<CompletionLog>,
    events: Option<Mutex<NdjsonWriter>>,
}

impl Journal {
    pub fn open(
        completion_log: impl AsRef<Path>,
        events_path: Option<&Path>,
        flush_every_lines: u64,
    ) -> Result<Self, NdjsonError> {
        let completions = Mutex::new(CompletionLog::open(completion_log)?);
        let events = match events_path {
            Some(p) => Some(Mutex::new(NdjsonWriter::open_append(p, flush_every_lines)?)),
            None => None,
        };
        Ok(Self {
            completions,
            events,
        })
    }

    pub fn record_completion(&self, unit: &str) -> Result<(), NdjsonError> {
        let mut log = self.completions.lock().unwrap_or_else(|e| e.into_inner());
        log.append(unit)
    }

    pub fn record_event<T: Serialize>(&self, event: &T) -> Result<(), NdjsonError> {
        match &self.events {
            Some(w) => w.lock().unwrap_or_else(|e| e.into_inner()).write_event(event),
            None => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<(), NdjsonError> {
        if let Some(w) = &self.events {
            w.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        }
        Ok(())
    }
}

fn open_append_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use serde_json::Value;

    fn parse_lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn episode_event(session: u64, unit: &str) -> EpisodeEventV1 {
        EpisodeEventV1 {
            event: "episode_end",
            ts_ms: now_ms(),
            session,
            unit: Some(unit.to_string()),
            steps: 2,
            cumulative_reward: 1.5,
            actions: vec![3, 7],
            aborted: false,
            error: None,
        }
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn each_event_is_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut w = NdjsonWriter::open_append(&path, 0).unwrap();

        w.write_event(&episode_event(1, "a.ll")).unwrap();
        w.write_event(&ServeEventV1::new("peer_connected", "remote").session(4))
            .unwrap();
        w.flush().unwrap();

        let vals = parse_lines(&path);
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0]["actions"], serde_json::json!([3, 7]));
        assert_eq!(vals[1]["event"], "peer_connected");
        assert_eq!(vals[1]["session"], 4);
    }

    #[test]
    fn completion_log_appends_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actionlist.txt");
        {
            let mut log = CompletionLog::open(&path).unwrap();
            log.append("test_ll/a.ll").unwrap();
        }
        let mut log = CompletionLog::open(&path).unwrap();
        log.append("test_ll/b\n.ll").unwrap();

        let s = fs::read_to_string(&path).unwrap();
        assert_eq!(s, "test_ll/a.ll\ntest_ll/b .ll\n");
    }

    #[test]
    fn journal_without_event_log_still_records_completions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("done.txt");
        let j = Journal::open(&path, None, 1).unwrap();
        j.record_completion("u1").unwrap();
        j.record_event(&episode_event(1, "u1")).unwrap();
        j.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "u1\n");
    }

    #[test]
    fn journal_flushes_events_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join("events.ndjson");
        let j = Journal::open(dir.path().join("done.txt"), Some(&events), 1).unwrap();
        j.record_event(&episode_event(9, "x")).unwrap();
        // No explicit flush: flush_every_lines=1 already wrote it out.
        let vals = parse_lines(&events);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0]["session"], 9);
    }

    #[test]
    fn stale_tmp_file_does_not_shadow_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("events.run.json");

        let mut m = RunManifestV1 {
            run_manifest_version: RUN_MANIFEST_VERSION,
            run_id: "r".to_string(),
            created_ts_ms: now_ms(),
            protocol_version: 1,
            advisor_version: VERSION.to_string(),
            target: "X86".to_string(),
            transport_mode: "pipe".to_string(),
            encoding: "json".to_string(),
            state_size: 300,
            action_space_size: 34,
            checkpoint: "models/p.safetensors".to_string(),
            export_path: None,
            git_hash: None,
            config_hash: Some(hash_config_bytes(b"policy: {}")),
        };
        write_manifest_atomic(&manifest, &m).unwrap();

        // Left over from an interrupted write.
        let tmp = manifest.with_extension("json.tmp");
        fs::write(&tmp, b"{not valid json").unwrap();

        let got = read_manifest(&manifest).unwrap();
        assert_eq!(got.run_id, "r");
        assert_eq!(got.config_hash.as_deref().map(str::len), Some(64));

        m.encoding = "msgpack".to_string();
        write_manifest_atomic(&manifest, &m).unwrap();
        assert_eq!(read_manifest(&manifest).unwrap().encoding, "msgpack");
    }
}
