//! Persistence backends for decision traces.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};

use crate::delivery_connection::lock_unpoisoned;
use crate::delivery_time::current_unix_timestamp_ms;
use crate::delivery_trace::DecisionTrace;

/// Trait contract for `DecisionTraceStore` behavior.
pub trait DecisionTraceStore: Send + Sync {
    fn append(&self, trace: &DecisionTrace) -> Result<()>;
    fn load_all(&self) -> Result<Vec<DecisionTrace>>;
    /// Removes every trace stamped before `cutoff_unix_ms`; returns the count.
    fn purge_before(&self, cutoff_unix_ms: u64) -> Result<usize>;
}

#[derive(Debug, Default)]
/// Process-local trace store.
pub struct InMemoryDecisionTraceStore {
    traces: Mutex<Vec<DecisionTrace>>,
}

impl DecisionTraceStore for InMemoryDecisionTraceStore {
    fn append(&self, trace: &DecisionTrace) -> Result<()> {
        lock_unpoisoned(&self.traces).push(trace.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<DecisionTrace>> {
        Ok(lock_unpoisoned(&self.traces).clone())
    }

    fn purge_before(&self, cutoff_unix_ms: u64) -> Result<usize> {
        let mut traces = lock_unpoisoned(&self.traces);
        let before = traces.len();
        traces.retain(|trace| trace.timestamp_unix_ms >= cutoff_unix_ms);
        Ok(before - traces.len())
    }
}

enum TraceWriterCommand {
    Append(String),
    Flush(mpsc::SyncSender<()>),
}

#[derive(Debug)]
/// Append-only NDJSON trace log; retention purges rewrite the file atomically.
///
/// Appends are encoded on the caller and handed to a dedicated writer thread,
/// so recording a trace from an async task never touches the filesystem.
/// Reads and purges flush the writer first.
pub struct JsonlDecisionTraceStore {
    path: PathBuf,
    io_lock: Arc<Mutex<()>>,
    writer: Mutex<mpsc::Sender<TraceWriterCommand>>,
}

impl JsonlDecisionTraceStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            bail!("decision trace store path cannot be empty");
        }
        if path.is_dir() {
            bail!("decision trace store path '{}' is a directory", path.display());
        }
        create_parent_dir_if_needed(&path)?;
        let io_lock = Arc::new(Mutex::new(()));
        let writer = spawn_trace_writer(path.clone(), io_lock.clone())?;
        Ok(Self {
            path,
            io_lock,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until every append queued so far is on disk.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = mpsc::sync_channel(1);
        lock_unpoisoned(&self.writer)
            .send(TraceWriterCommand::Flush(ack))
            .map_err(|_| anyhow!("decision trace writer for {} stopped", self.path.display()))?;
        done.recv()
            .context("decision trace writer stopped before flushing")?;
        Ok(())
    }

    fn read_traces_locked(&self) -> Result<Vec<DecisionTrace>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut traces = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<DecisionTrace>(trimmed) {
                Ok(trace) => traces.push(trace),
                Err(error) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        %error,
                        "skipping malformed decision trace line"
                    );
                }
            }
        }
        Ok(traces)
    }
}

impl DecisionTraceStore for JsonlDecisionTraceStore {
    fn append(&self, trace: &DecisionTrace) -> Result<()> {
        let line = serde_json::to_string(trace).context("failed to encode decision trace")?;
        lock_unpoisoned(&self.writer)
            .send(TraceWriterCommand::Append(line))
            .map_err(|_| anyhow!("decision trace writer for {} stopped", self.path.display()))
    }

    fn load_all(&self) -> Result<Vec<DecisionTrace>> {
        self.flush()?;
        let _guard = lock_unpoisoned(&self.io_lock);
        self.read_traces_locked()
    }

    fn purge_before(&self, cutoff_unix_ms: u64) -> Result<usize> {
        self.flush()?;
        let _guard = lock_unpoisoned(&self.io_lock);
        let traces = self.read_traces_locked()?;
        let before = traces.len();
        let mut retained = String::new();
        let mut kept = 0usize;
        for trace in traces
            .iter()
            .filter(|trace| trace.timestamp_unix_ms >= cutoff_unix_ms)
        {
            retained.push_str(
                &serde_json::to_string(trace).context("failed to encode decision trace")?,
            );
            retained.push('\n');
            kept += 1;
        }
        if kept == before {
            return Ok(0);
        }
        write_text_atomic(&self.path, &retained)?;
        Ok(before - kept)
    }
}

/// Writer loop: batches whatever is queued, appends it under the I/O lock,
/// then acknowledges pending flushes. Exits once the store is dropped.
fn spawn_trace_writer(
    path: PathBuf,
    io_lock: Arc<Mutex<()>>,
) -> Result<mpsc::Sender<TraceWriterCommand>> {
    let (sender, receiver) = mpsc::channel::<TraceWriterCommand>();
    std::thread::Builder::new()
        .name("tau-delivery-trace-writer".to_string())
        .spawn(move || {
            while let Ok(first) = receiver.recv() {
                let mut lines = Vec::new();
                let mut acks = Vec::new();
                for command in std::iter::once(first).chain(receiver.try_iter()) {
                    match command {
                        TraceWriterCommand::Append(line) => lines.push(line),
                        TraceWriterCommand::Flush(ack) => acks.push(ack),
                    }
                }
                if !lines.is_empty() {
                    let _guard = lock_unpoisoned(&*io_lock);
                    if let Err(error) = append_lines(&path, &lines) {
                        tracing::warn!(
                            path = %path.display(),
                            lines = lines.len(),
                            error = %format!("{error:#}"),
                            "failed to persist decision traces"
                        );
                    }
                }
                for ack in acks {
                    let _ = ack.send(());
                }
            }
        })
        .context("failed to spawn decision trace writer thread")?;
    Ok(sender)
}

fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut payload = String::new();
    for line in lines {
        payload.push_str(line);
        payload.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(payload.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn create_parent_dir_if_needed(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Writes via temp file + rename so readers never observe a partial log.
fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("decision-traces"),
        std::process::id(),
        current_unix_timestamp_ms()
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary trace log {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::delivery_trace::{TraceDecision, TraceReasonCode, TraceStage};

    fn trace(id: &str, timestamp_unix_ms: u64) -> DecisionTrace {
        DecisionTrace {
            trace_id: format!("trace-{id}"),
            message_id: id.to_string(),
            destination_hash: "dst_0123".to_string(),
            timestamp_unix_ms,
            stage: TraceStage::Send,
            decision: TraceDecision::Respond,
            reason_code: TraceReasonCode::Sent,
            detail: None,
            next_eligible_at_unix_ms: None,
            correlation_id: None,
        }
    }

    #[test]
    fn unit_in_memory_store_purges_by_cutoff() {
        let store = InMemoryDecisionTraceStore::default();
        store.append(&trace("a", 10)).expect("append");
        store.append(&trace("b", 20)).expect("append");
        assert_eq!(store.purge_before(15).expect("purge"), 1);
        let remaining = store.load_all().expect("load");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "b");
    }

    #[test]
    fn functional_jsonl_store_appends_and_reloads() {
        let temp = tempdir().expect("tempdir");
        let store =
            JsonlDecisionTraceStore::new(temp.path().join("traces/decisions.jsonl")).expect("store");
        store.append(&trace("a", 10)).expect("append");
        store.append(&trace("b", 20)).expect("append");
        store.flush().expect("flush");

        let reopened = JsonlDecisionTraceStore::new(store.path().to_path_buf()).expect("reopen");
        let loaded = reopened.load_all().expect("load");
        assert_eq!(loaded, vec![trace("a", 10), trace("b", 20)]);
    }

    #[test]
    fn regression_jsonl_store_skips_malformed_lines() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("decisions.jsonl");
        let store = JsonlDecisionTraceStore::new(&path).expect("store");
        store.append(&trace("a", 10)).expect("append");
        store.flush().expect("flush");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{{not json").expect("write garbage");
        store.append(&trace("b", 20)).expect("append");

        assert_eq!(store.load_all().expect("load").len(), 2);
        assert_eq!(store.purge_before(15).expect("purge"), 1);
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 1);
        assert!(!raw.contains("not json"));
    }

    #[test]
    fn regression_jsonl_store_rejects_directory_path() {
        let temp = tempdir().expect("tempdir");
        let error = JsonlDecisionTraceStore::new(temp.path()).expect_err("directory");
        assert!(error.to_string().contains("is a directory"));
    }

    #[test]
    fn functional_jsonl_store_appends_from_many_threads_without_interleaving() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(
            JsonlDecisionTraceStore::new(temp.path().join("decisions.jsonl")).expect("store"),
        );
        let workers = (0..4u64)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for index in 0..25u64 {
                        store
                            .append(&trace(&format!("w{worker}-{index}"), worker * 100 + index))
                            .expect("append");
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("worker");
        }
        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 100);
        let raw = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(raw.lines().count(), 100);
    }
}
