//! Log tailing for supervised processes
//!
//! Picks the most recently written `<base>-out.log` / `<base>-error.log`
//! files of the supervisor's log directory and returns their last lines,
//! attributed to the logical process name. Files are read backwards from
//! the end so large logs cost only a few chunks.

use crate::config::TailConfig;
use pmrelay_contracts::{LogKind, LogLine, ProcessSnapshot};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

const CHUNK_SIZE: u64 = 8 * 1024;

/// Collect the latest log lines, oldest first, capped at `limits.max_batch`.
pub fn tail(log_dir: &Path, snapshot: &[ProcessSnapshot], limits: &TailConfig) -> Vec<LogLine> {
    let files = match recent_log_files(log_dir, limits.max_files) {
        Ok(files) => files,
        Err(e) => {
            debug!("No log directory {}: {}", log_dir.display(), e);
            return Vec::new();
        }
    };
    let names = name_table(snapshot);

    let mut batch = Vec::new();
    for path in files {
        let Some((base, kind)) = path.file_name().and_then(|n| n.to_str()).and_then(split_log_name) else {
            continue;
        };
        let process = names.get(base).cloned().unwrap_or_else(|| base.to_string());
        match read_last_lines(&path, limits.lines_per_file) {
            Ok(lines) => {
                batch.extend(lines.into_iter().map(|message| LogLine { process: process.clone(), kind, message }))
            }
            Err(e) => warn!("Skipping log file {}: {}", path.display(), e),
        }
    }

    if batch.len() > limits.max_batch {
        batch.drain(..batch.len() - limits.max_batch);
    }
    batch
}

/// File-name base -> logical name. The supervisor writes `my app` logs to
/// `my-app-out.log`; when two names collide the later entry wins.
fn name_table(snapshot: &[ProcessSnapshot]) -> HashMap<String, String> {
    snapshot.iter().map(|p| (p.name.replace(' ', "-"), p.name.clone())).collect()
}

fn split_log_name(file_name: &str) -> Option<(&str, LogKind)> {
    if let Some(base) = file_name.strip_suffix("-out.log") {
        return (!base.is_empty()).then_some((base, LogKind::Output));
    }
    if let Some(base) = file_name.strip_suffix("-error.log") {
        return (!base.is_empty()).then_some((base, LogKind::Error));
    }
    None
}

/// The `max_files` most recently modified `.log` files, oldest first.
fn recent_log_files(dir: &Path, max_files: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        files.push((meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), path));
    }
    files.sort();
    let skip = files.len().saturating_sub(max_files);
    Ok(files.into_iter().skip(skip).map(|(_, p)| p).collect())
}

/// Last `n` non-blank lines of a file, read backwards in chunks.
fn read_last_lines(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut pos = file.seek(SeekFrom::End(0))?;
    let mut buf: Vec<u8> = Vec::new();

    while pos > 0 {
        let step = CHUNK_SIZE.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // the first line may be cut, so require one more than needed
        if pos > 0 && count_non_blank(&buf) > n {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    if pos > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let kept: Vec<String> = lines
        .into_iter()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !is_blank(l))
        .map(str::to_string)
        .collect();
    let skip = kept.len().saturating_sub(n);
    Ok(kept.into_iter().skip(skip).collect())
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn count_non_blank(buf: &[u8]) -> usize {
    String::from_utf8_lossy(buf).lines().filter(|l| !is_blank(l)).count()
}
