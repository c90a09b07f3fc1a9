// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistence (C7): whole-file dumps of the four job-state sets under a
//! per-session directory, named `<dataDir>/<YYYYMMDD-HHMMSS>/`. Each state
//! is its own file, written in one shot with `rmp_serde` rather than
//! incrementally appended, so a crash mid-write leaves at worst one stale
//! state file rather than a corrupt log.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;

use crate::model::{Job, FAILED, FINISHED, QUEUED, RUNNING};

/// The four state sets as loaded from disk, before the caller decides how
/// to fold them into the live server (per-client ownership, selection).
#[derive(Default)]
pub struct LoadedSession {
    pub queued: Vec<Job>,
    pub running: Vec<Job>,
    pub finished: Vec<Job>,
    pub failed: Vec<Job>,
}

/// Creates a fresh, empty session directory named from the current time
/// and returns its path.
pub fn new_session_dir(data_dir: &Path) -> anyhow::Result<PathBuf> {
    let name = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let dir = data_dir.join(name);
    fs::create_dir_all(&dir).with_context(|| format!("creating session dir {}", dir.display()))?;
    Ok(dir)
}

/// Writes one state file. Missing parent directories are an error: the
/// session directory must already exist (created by [`new_session_dir`]).
pub fn dump_state(session_dir: &Path, name: &str, jobs: &[Job]) -> anyhow::Result<()> {
    let bytes = rmp_serde::to_vec(jobs).context("encoding state for persistence")?;
    let path = session_dir.join(name);
    fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
}

/// Dumps all four states for a session in one call, used by the
/// cancellation sequence (§5) and available for periodic checkpointing.
pub fn dump_session(
    session_dir: &Path,
    queued: &[Job],
    running: &[Job],
    finished: &[Job],
    failed: &[Job],
) -> anyhow::Result<()> {
    dump_state(session_dir, QUEUED, queued)?;
    dump_state(session_dir, RUNNING, running)?;
    dump_state(session_dir, FINISHED, finished)?;
    dump_state(session_dir, FAILED, failed)?;
    Ok(())
}

/// Reads one state file. A missing file is not an error — a session that
/// never had, say, any failed jobs simply has no `failed` file — and
/// decodes to an empty vec.
fn load_state(session_dir: &Path, name: &str) -> anyhow::Result<Vec<Job>> {
    let path = session_dir.join(name);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    rmp_serde::from_slice(&bytes).with_context(|| format!("decoding {}", path.display()))
}

/// Loads all four states for a named session.
pub fn load_session(data_dir: &Path, session: &str) -> anyhow::Result<LoadedSession> {
    let dir = data_dir.join(session);
    anyhow::ensure!(dir.is_dir(), "no such session: {}", session);
    Ok(LoadedSession {
        queued: load_state(&dir, QUEUED)?,
        running: load_state(&dir, RUNNING)?,
        finished: load_state(&dir, FINISHED)?,
        failed: load_state(&dir, FAILED)?,
    })
}

/// Lists loadable session names under the data directory, oldest first.
/// A directory counts as a session if it contains at least one of the
/// four state files; anything else under `data_dir` is ignored.
pub fn list_sessions(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(data_dir).with_context(|| format!("reading {}", data_dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let has_state = [QUEUED, RUNNING, FINISHED, FAILED].iter().any(|n| path.join(n).exists());
        if has_state {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Job;

    #[test]
    #[ntest::timeout(1000)]
    fn round_trip_preserves_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let session_dir = new_session_dir(tmp.path()).unwrap();
        let queued = vec![Job::new(1, "aaaaaaaaaaa".to_string())];
        let running = vec![Job::new(2, "bbbbbbbbbbb".to_string())];
        let finished = vec![Job::new(1, "ccccccccccc".to_string())];
        let failed = vec![Job::new(3, "ddddddddddd".to_string())];
        dump_session(&session_dir, &queued, &running, &finished, &failed).unwrap();

        let name = session_dir.file_name().unwrap().to_str().unwrap();
        let loaded = load_session(tmp.path(), name).unwrap();
        assert_eq!(loaded.queued, queued);
        assert_eq!(loaded.running, running);
        assert_eq!(loaded.finished, finished);
        assert_eq!(loaded.failed, failed);
    }

    #[test]
    #[ntest::timeout(1000)]
    fn missing_state_file_loads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let session_dir = new_session_dir(tmp.path()).unwrap();
        dump_state(&session_dir, QUEUED, &[Job::new(1, "aaaaaaaaaaa".to_string())]).unwrap();

        let name = session_dir.file_name().unwrap().to_str().unwrap();
        let loaded = load_session(tmp.path(), name).unwrap();
        assert_eq!(loaded.queued.len(), 1);
        assert!(loaded.running.is_empty());
        assert!(loaded.finished.is_empty());
        assert!(loaded.failed.is_empty());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn list_sessions_ignores_non_session_directories() {
        let tmp = tempfile::tempdir().unwrap();
        new_session_dir(tmp.path()).unwrap();
        fs::create_dir_all(tmp.path().join("not-a-session")).unwrap();

        let sessions = list_sessions(tmp.path()).unwrap();
        assert_eq!(sessions.len(), 1);
    }
}
