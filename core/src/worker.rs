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

//! Worker (C4): a long-running component with a single-entry mailbox that
//! downloads one item at a time and reports the outcome back to the
//! server.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{info, instrument};

use crate::downloader::Downloader;
use crate::model::Job;
use crate::server::ServerMsg;

/// The message a worker's mailbox accepts. `Stop` finishes the current
/// download (no mid-download cancellation) and then the thread exits.
pub enum WorkerMsg {
    Task(Job),
    Stop,
}

/// A handle the server keeps for a running worker thread: a mailbox to
/// send it work and its private cookie-file path (copied from the
/// canonical cookie file at startup, merged back on stop).
pub struct WorkerHandle {
    pub name: String,
    pub cookie_path: PathBuf,
    pub inbox: crossbeam_channel::Sender<WorkerMsg>,
    pub join: Option<thread::JoinHandle<()>>,
}

/// Spawns the worker's thread; returns its handle so the caller can wait
/// for it to finish after sending `Stop`.
#[instrument(skip(inbox, to_server, downloader))]
pub fn spawn(
    name: String,
    inbox: crossbeam_channel::Receiver<WorkerMsg>,
    to_server: crossbeam_channel::Sender<ServerMsg>,
    cookie_path: PathBuf,
    downloader: Arc<dyn Downloader>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!(worker = %name, "worker started");
        for msg in inbox.iter() {
            match msg {
                WorkerMsg::Task(job) => {
                    info!(worker = %name, item = %job.item_id, "downloading");
                    let result = downloader.download(&job.item_id, &cookie_path);
                    let (ok, err) = match result {
                        Ok(()) => (true, String::new()),
                        Err(e) => (false, e),
                    };
                    // The worker only transitions back to `free` once the
                    // server has the Ack in hand; since `free` is tracked
                    // by the server (the sole authority on the four job
                    // sets), sending this message off is what effects that
                    // transition.
                    if to_server.send(ServerMsg::Ack { job, ok, err }).is_err() {
                        info!(worker = %name, "server inbox closed, exiting");
                        return;
                    }
                }
                WorkerMsg::Stop => {
                    info!(worker = %name, "worker stopping");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::path::Path;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use jobd_protocol::{ItemId, PlaylistId};

    use super::*;

    struct AlwaysSucceeds;
    impl Downloader for AlwaysSucceeds {
        fn download(&self, _item: &ItemId, _cookie_path: &Path) -> Result<(), String> {
            Ok(())
        }
        fn expand_playlist(&self, _playlist: &PlaylistId, _cookie_path: &Path) -> Result<HashSet<ItemId>, String> {
            Ok(HashSet::new())
        }
    }

    #[test]
    #[ntest::timeout(2000)]
    fn a_task_is_downloaded_and_acked() {
        let (inbox, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let (to_server, from_worker) = crossbeam_channel::unbounded::<ServerMsg>();
        let tmp = tempfile::tempdir().unwrap();

        let join = spawn("w".to_string(), rx, to_server, tmp.path().to_path_buf(), Arc::new(AlwaysSucceeds));

        let job = Job::new(1, "aaaaaaaaaaa".to_string());
        inbox.send(WorkerMsg::Task(job)).unwrap();

        let ack = from_worker.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_matches!(ack, ServerMsg::Ack { ok: true, .. });

        inbox.send(WorkerMsg::Stop).unwrap();
        join.join().unwrap();
    }
}
