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

//! Server (C5): the single-threaded scheduler that owns every job, client
//! and worker record in the process. Everything here runs on one thread —
//! the mailbox loop in [`Server::run`] — so no field needs a lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;
use crossbeam_channel::{Receiver, Sender};
use jobd_protocol::{ItemId, LoadSelection, PlaylistId, QueryId};
use tracing::{info, warn};

use crate::downloader::Downloader;
use crate::model::{ClientId, ClientRecord, Job};
use crate::persistence;
use crate::transport::Transport;
use crate::worker::{WorkerHandle, WorkerMsg};

/// The closed set of events the server reacts to. Every external trigger —
/// a decoded client message, a worker's completion, a transport event, or a
/// shutdown request — is funneled through this one enum so the scheduler
/// never needs to reason about more than one inbox.
pub enum ServerMsg {
    Connected(ClientId),
    Disconnected(ClientId),
    /// First message on a connection, carrying the token a client cached
    /// locally across invocations. Resolves `client_id` (the raw,
    /// per-connection id) to a stable owner id shared by every connection
    /// that has ever presented this same token, so a one-shot CLI's
    /// `List`/`Retry`/`Discard` can see jobs a previous invocation queued.
    Hello { client_id: ClientId, client_key: String },
    AddCode { client_id: ClientId, query_id: QueryId, item_id: ItemId },
    AddList { client_id: ClientId, query_id: QueryId, playlist_id: PlaylistId },
    Retry { client_id: ClientId },
    Discard { client_id: ClientId },
    List { client_id: ClientId, query_id: QueryId },
    SessionList { client_id: ClientId, query_id: QueryId },
    LoadAll { client_id: ClientId, query_id: QueryId, session: String, selection: LoadSelection },
    /// Self-sent trampoline: re-examine whether any queued job can be
    /// handed to a free worker. Pushed after every state change that might
    /// unblock dispatch (an add, a retry, a load, or a completed job
    /// freeing its worker) rather than driven by a dedicated timer thread.
    Allocate,
    Ack { job: Job, ok: bool, err: String },
    Stop,
}

struct FailedJob {
    job: Job,
    err: String,
}

/// The scheduler. Every collection here is touched only from
/// [`Server::run`]'s thread; `to_self` and the transport are the only
/// fields other threads reach into, and both are already safe to share.
pub struct Server {
    transport: Arc<Transport>,
    downloader: Arc<dyn Downloader>,
    data_dir: PathBuf,
    /// This run's session directory, named from the start timestamp (§3).
    /// `None` only if it could not be created, in which case persistence is
    /// skipped (logged once per occurrence) rather than treated as fatal.
    session_dir: Option<PathBuf>,
    canonical_cookie_path: PathBuf,

    clients: HashMap<ClientId, ClientRecord>,

    /// Maps a client's persistent identity token (§`Hello`) to the stable
    /// owner id every connection presenting that token shares.
    owners: HashMap<String, ClientId>,
    /// Resolves a connection's raw id to the owner id it claimed via
    /// `Hello`. A connection that never says hello falls back to using its
    /// own raw id as its owner id, so tests and any caller that drives the
    /// server directly need no handshake at all.
    conn_to_owner: HashMap<ClientId, ClientId>,
    next_owner_id: ClientId,

    queued: VecDeque<Job>,
    running: HashMap<Job, usize>,
    finished: HashSet<Job>,
    failed: Vec<FailedJob>,

    workers: Vec<WorkerHandle>,
    free_workers: VecDeque<usize>,

    /// A sender back onto this server's own mailbox, used for the
    /// `Allocate` trampoline (§9): a handler that might unblock dispatch
    /// self-sends `Allocate` instead of calling `try_allocate` inline, so
    /// allocation always runs as its own mailbox entry.
    to_self: Sender<ServerMsg>,
}

impl Server {
    pub fn new(
        transport: Arc<Transport>,
        downloader: Arc<dyn Downloader>,
        data_dir: PathBuf,
        canonical_cookie_path: PathBuf,
        workers: Vec<WorkerHandle>,
        to_self: Sender<ServerMsg>,
    ) -> Self {
        let free_workers = (0..workers.len()).collect();
        let session_dir = match persistence::new_session_dir(&data_dir) {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!("failed to create session directory, persistence disabled: {:?}", e);
                None
            }
        };
        Server {
            transport,
            downloader,
            data_dir,
            session_dir,
            canonical_cookie_path,
            clients: HashMap::new(),
            owners: HashMap::new(),
            conn_to_owner: HashMap::new(),
            next_owner_id: 0,
            queued: VecDeque::new(),
            running: HashMap::new(),
            finished: HashSet::new(),
            failed: Vec::new(),
            workers,
            free_workers,
            to_self,
        }
    }

    /// Resolves a connection's raw id to the owner id its `Hello` (if any)
    /// claimed. Connections that never said hello are their own owner.
    fn owner_for(&self, raw_conn_id: ClientId) -> ClientId {
        self.conn_to_owner.get(&raw_conn_id).copied().unwrap_or(raw_conn_id)
    }

    /// Runs until a [`ServerMsg::Stop`] is received, tells every worker to
    /// stop, persists final state, then hands the worker handles back to
    /// the caller so it can finish the cancellation sequence (§5): join
    /// each worker (it finishes its current download first, no mid-task
    /// cancellation) and merge their cookie files.
    pub fn run(mut self, inbox: Receiver<ServerMsg>) -> Vec<WorkerHandle> {
        for msg in inbox.iter() {
            match msg {
                ServerMsg::Stop => {
                    info!("server stopping");
                    for w in &self.workers {
                        let _ = w.inbox.send(WorkerMsg::Stop);
                    }
                    self.persist();
                    return self.workers;
                }
                other => self.handle(other),
            }
        }
        self.workers
    }

    fn handle(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::Connected(cid) => {
                self.clients.insert(cid, ClientRecord { id: cid, connected: true });
            }
            ServerMsg::Disconnected(cid) => {
                if let Some(rec) = self.clients.get_mut(&cid) {
                    rec.connected = false;
                }
            }
            ServerMsg::Hello { client_id, client_key } => {
                let owner_id = *self.owners.entry(client_key).or_insert_with(|| {
                    let id = self.next_owner_id;
                    self.next_owner_id += 1;
                    id
                });
                self.conn_to_owner.insert(client_id, owner_id);
            }
            ServerMsg::AddCode { client_id, query_id, item_id } => {
                let owner = self.owner_for(client_id);
                let text = self.add_code(owner, item_id);
                self.persist();
                self.respond(client_id, query_id, text);
            }
            ServerMsg::AddList { client_id, query_id, playlist_id } => {
                let owner = self.owner_for(client_id);
                match self.downloader.expand_playlist(&playlist_id, &self.canonical_cookie_path) {
                    Ok(items) => {
                        // One reply per expanded item, all reusing this
                        // query_id, exactly as if the client had sent one
                        // AddCode per item (§4.5).
                        for item_id in items {
                            let text = self.add_code(owner, item_id);
                            self.respond(client_id, query_id, text);
                        }
                        self.persist();
                    }
                    Err(e) => {
                        let text = format!("playlist '{playlist_id}' failed to expand: {e}");
                        self.respond(client_id, query_id, text);
                    }
                }
            }
            ServerMsg::Retry { client_id } => {
                let owner = self.owner_for(client_id);
                let mut remaining = Vec::with_capacity(self.failed.len());
                for f in self.failed.drain(..) {
                    if f.job.client_id == owner {
                        self.queued.push_back(f.job);
                    } else {
                        remaining.push(f);
                    }
                }
                self.failed = remaining;
                let _ = self.to_self.send(ServerMsg::Allocate);
                self.persist();
            }
            ServerMsg::Discard { client_id } => {
                let owner = self.owner_for(client_id);
                self.failed.retain(|f| f.job.client_id != owner);
                self.persist();
            }
            ServerMsg::List { client_id, query_id } => {
                let owner = self.owner_for(client_id);
                let text = self.describe(owner);
                self.respond(client_id, query_id, text);
            }
            ServerMsg::SessionList { client_id, query_id } => {
                let text = match persistence::list_sessions(&self.data_dir) {
                    Ok(names) if names.is_empty() => "no sessions on disk".to_string(),
                    Ok(names) => names.join("\n"),
                    Err(e) => format!("failed to list sessions: {e}"),
                };
                self.respond(client_id, query_id, text);
            }
            ServerMsg::LoadAll { client_id, query_id, session, selection } => {
                let owner = self.owner_for(client_id);
                let text = self.load_session(owner, &session, selection);
                self.persist();
                self.respond(client_id, query_id, text);
            }
            ServerMsg::Allocate => {
                self.try_allocate();
                self.persist();
            }
            ServerMsg::Ack { job, ok, err } => {
                if let Some(idx) = self.running.remove(&job) {
                    self.free_workers.push_back(idx);
                }
                if ok {
                    self.finished.insert(job);
                } else {
                    warn!(item = %job.item_id, error = %err, "download failed");
                    self.failed.push(FailedJob { job, err });
                }
                let _ = self.to_self.send(ServerMsg::Allocate);
                self.persist();
            }
            ServerMsg::Stop => unreachable!("handled in run()"),
        }
    }

    /// Queues a single item for `client_id`, or reports why it already
    /// has an outcome, per §4.5's `AddCode` row. Shared by `AddCode` and
    /// each item an `AddList` expansion produces.
    fn add_code(&mut self, client_id: ClientId, item_id: ItemId) -> String {
        let job = Job::new(client_id, item_id.clone());
        if self.running.contains_key(&job) {
            return format!("YT code '{item_id}' already being processed");
        }
        if self.finished.contains(&job) {
            return format!("YT code '{item_id}' already processed");
        }
        // Re-adding a job still sitting in `queued` is a no-op (the queue
        // behaves like a set here); re-adding one that previously failed
        // pulls it out of `failed` and back into `queued` so a client can
        // retry a single item without calling `Retry` for all of them —
        // unlike the failed/queued overlap this can otherwise produce,
        // every job stays in exactly one state set (§3).
        self.failed.retain(|f| f.job != job);
        if !self.queued.contains(&job) {
            self.queued.push_back(job);
        }
        let _ = self.to_self.send(ServerMsg::Allocate);
        format!("YT code '{item_id}' queued")
    }

    /// Loop until no free worker or no queued job remains (§4.5). Driven
    /// from every state change that could unblock it rather than a
    /// fixed-cadence sweep.
    fn try_allocate(&mut self) {
        loop {
            let Some(idx) = self.free_workers.pop_front() else { break };
            let Some(job) = self.queued.pop_front() else {
                self.free_workers.push_front(idx);
                break;
            };
            self.running.insert(job.clone(), idx);
            if self.workers[idx].inbox.send(WorkerMsg::Task(job)).is_err() {
                warn!(worker = %self.workers[idx].name, "worker inbox gone, treating as idle");
            }
        }
    }

    /// Formats this client's four job sets the way the original shell
    /// client's list command did: one colour-tagged section per non-empty
    /// set (finished green, failed red, running blue, queued yellow), a
    /// label line followed by one indented line per item, empty sections
    /// omitted entirely.
    fn describe(&self, client_id: ClientId) -> String {
        let mine = |j: &&Job| j.client_id == client_id;
        let queued: Vec<_> = self.queued.iter().filter(mine).map(|j| j.item_id.clone()).collect();
        let running: Vec<_> = self.running.keys().filter(mine).map(|j| j.item_id.clone()).collect();
        let finished: Vec<_> = self.finished.iter().filter(mine).map(|j| j.item_id.clone()).collect();
        let failed: Vec<_> = self.failed.iter().filter(|f| f.job.client_id == client_id).map(|f| f.job.item_id.clone()).collect();

        let mut sections = Vec::new();
        if !finished.is_empty() {
            sections.push(section("finished", &finished, |s| s.green()));
        }
        if !failed.is_empty() {
            sections.push(section("failed", &failed, |s| s.red()));
        }
        if !running.is_empty() {
            sections.push(section("running", &running, |s| s.blue()));
        }
        if !queued.is_empty() {
            sections.push(section("queued", &queued, |s| s.yellow()));
        }

        if sections.is_empty() {
            "nothing queued, running, finished or failed".to_string()
        } else {
            sections.join("\n")
        }
    }

    fn load_session(&mut self, client_id: ClientId, session: &str, selection: LoadSelection) -> String {
        let loaded = match persistence::load_session(&self.data_dir, session) {
            Ok(l) => l,
            Err(e) => return format!("failed to load session {session}: {e}"),
        };

        let mut pending_added = 0usize;
        let mut finished_added = 0usize;

        // A job persisted as "running" reflects a worker that no longer
        // exists in this process; treated as pending, it simply re-enters
        // the queue like anything else loaded. Every loaded job is
        // rehomed onto the requesting client, since the jobs in an old
        // session belonged to whichever client ids that run happened to
        // assign.
        let pending_jobs = |loaded_selection: LoadSelection, loaded: &persistence::LoadedSession| -> Vec<Job> {
            match loaded_selection {
                LoadSelection::All | LoadSelection::PendingOnly => loaded
                    .queued
                    .iter()
                    .chain(&loaded.running)
                    .chain(&loaded.failed)
                    .map(|j| Job::new(client_id, j.item_id.clone()))
                    .collect(),
                LoadSelection::FinishedOnly => Vec::new(),
            }
        };

        for job in pending_jobs(selection, &loaded) {
            if self.running.contains_key(&job) || self.finished.contains(&job) {
                continue;
            }
            self.failed.retain(|f| f.job != job);
            if !self.queued.contains(&job) {
                self.queued.push_back(job);
                pending_added += 1;
            }
        }

        if matches!(selection, LoadSelection::All | LoadSelection::FinishedOnly) {
            for j in loaded.finished {
                let job = Job::new(client_id, j.item_id);
                if self.finished.insert(job) {
                    finished_added += 1;
                }
            }
        }

        let _ = self.to_self.send(ServerMsg::Allocate);
        format!("{session}: {pending_added} job(s) loaded as pending, {finished_added} as finished")
    }

    /// Dumps the four job sets to this run's session directory (§3, §4.7):
    /// "persisted files always reflect the in-memory set they mirror
    /// immediately after a state transition". Called after every handler
    /// that can change `queued`/`running`/`finished`/`failed`, not only at
    /// shutdown. Jobs still in flight when this fires are dumped as
    /// `running`; on a later reload they are treated as pending (§9), since
    /// no worker survives a process restart to finish them.
    fn persist(&self) {
        let Some(dir) = &self.session_dir else { return };
        let queued: Vec<Job> = self.queued.iter().cloned().collect();
        let running: Vec<Job> = self.running.keys().cloned().collect();
        let finished: Vec<Job> = self.finished.iter().cloned().collect();
        let failed: Vec<Job> = self.failed.iter().map(|f| f.job.clone()).collect();

        if let Err(e) = persistence::dump_session(dir, &queued, &running, &finished, &failed) {
            warn!("failed to persist state: {:?}", e);
        }
    }

    fn respond(&self, client_id: ClientId, query_id: QueryId, text: String) {
        let msg = jobd_protocol::ServerMessage::Response { query_id, text };
        match crate::codec::encode_frame(&msg) {
            Ok(bytes) => self.transport.send(client_id, &bytes),
            Err(e) => warn!(client_id, "failed to encode response: {:?}", e),
        }
    }

    #[cfg(test)]
    fn state_counts(&self) -> (usize, usize, usize, usize) {
        (self.queued.len(), self.running.len(), self.finished.len(), self.failed.len())
    }
}

/// One colour-tagged block of a `List` reply: a bold label line, then one
/// indented, colourised line per item.
fn section(label: &str, items: &[ItemId], colour: impl Fn(&str) -> colored::ColoredString) -> String {
    let mut out = format!("{}", colour(label).bold());
    for item in items {
        out.push_str(&format!("\n  {}", colour(item)));
    }
    out
}
