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

//! Top-level daemon entrypoint: wires the transport, protocol layer,
//! worker pool and server together, then runs the cancellation sequence
//! (§5) once the server's mailbox loop returns.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use jobd_protocol::ClientMessage;
use tracing::info;

use crate::config::Config;
use crate::downloader::{Downloader, NullDownloader};
use crate::protocol_layer::{ProtocolEvent, ProtocolLayer};
use crate::server::{Server, ServerMsg};
use crate::signals;
use crate::transport::Transport;
use crate::worker::{self, WorkerHandle, WorkerMsg};

pub fn run(config: Config, daemonize: bool, downloader: Option<Arc<dyn Downloader>>) -> anyhow::Result<()> {
    if daemonize {
        let pid_file = config.server.data_dir.join("jobd.pid");
        info!(?pid_file, "daemonizing");
        daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
    }

    info!("\n\n======================== STARTING JOBD ============================\n\n");

    let downloader = downloader.unwrap_or_else(|| Arc::new(NullDownloader));
    let (to_server, from_anything) = crossbeam_channel::unbounded::<ServerMsg>();

    let workers = spawn_workers(&config, to_server.clone(), &downloader)?;

    let transport = Transport::new();
    let addr = format!("{}:{}", config.comm.ip, config.comm.port);
    let listener = Transport::bind(&addr)?;
    info!(%addr, "listening");

    let protocol_to_server = to_server.clone();
    let protocol_layer = Arc::new(ProtocolLayer::<ClientMessage>::new(move |event| {
        let msg = match event {
            ProtocolEvent::Connected(cid) => ServerMsg::Connected(cid),
            ProtocolEvent::Disconnected(cid) => ServerMsg::Disconnected(cid),
            ProtocolEvent::Message(cid, msg) => to_server_msg(cid, msg),
        };
        let _ = protocol_to_server.send(msg);
    }));

    let serve_transport = Arc::clone(&transport);
    let serve_listener = listener;
    let serve_subscriber = protocol_layer as Arc<dyn crate::transport::RawSubscriber>;
    let accept_thread = std::thread::spawn(move || {
        serve_transport.serve(serve_listener, serve_subscriber);
    });

    signals::Handler::spawn(to_server.clone())?;

    let canonical_cookie_path = config.server.cookies.clone();
    let server = Server::new(
        Arc::clone(&transport),
        downloader,
        config.server.data_dir.clone(),
        canonical_cookie_path.clone(),
        workers,
        to_server.clone(),
    );
    let mut workers = server.run(from_anything);

    // cancellation sequence (§5): stop accepting, let in-flight reads
    // drain and acks arrive, persist the final state (already done inside
    // `run`), join every worker (each finishes its current download
    // first), then merge and remove their cookie files.
    transport.stop();
    let _ = accept_thread.join();

    let cookie_paths: Vec<PathBuf> = workers.iter().map(|w| w.cookie_path.clone()).collect();
    for w in &mut workers {
        if let Some(join) = w.join.take() {
            let _ = join.join();
        }
    }
    if let Err(e) = merge_cookie_files(&canonical_cookie_path, &cookie_paths) {
        tracing::warn!("failed to merge worker cookie files: {:?}", e);
    }

    info!("jobd stopped");
    Ok(())
}

/// Merges each worker's private cookie file back into the canonical one,
/// then deletes the per-worker copies (§4.4, §5 step 4): one writer per
/// file while workers run, a single owner again once they have all
/// exited. Grounded on `ytconnector.mergeCookieFiles`: write a Netscape
/// cookie file header, then every non-comment, non-blank line from each
/// input file in turn.
fn merge_cookie_files(canonical: &std::path::Path, worker_cookie_paths: &[PathBuf]) -> anyhow::Result<()> {
    let mut merged = String::from("# Netscape HTTP Cookie File\n");
    for path in worker_cookie_paths {
        if !path.exists() {
            continue;
        }
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading worker cookie file {:?}", path))?;
        for line in contents.lines() {
            if !line.is_empty() && !line.starts_with('#') {
                merged.push_str(line);
                merged.push('\n');
            }
        }
    }
    std::fs::write(canonical, merged).with_context(|| format!("writing merged cookie file {:?}", canonical))?;
    for path in worker_cookie_paths {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn to_server_msg(client_id: crate::model::ClientId, msg: ClientMessage) -> ServerMsg {
    match msg {
        ClientMessage::Hello { client_key } => ServerMsg::Hello { client_id, client_key },
        ClientMessage::AddCode { query_id, item_id } => ServerMsg::AddCode { client_id, query_id, item_id },
        ClientMessage::AddList { query_id, playlist_id } => ServerMsg::AddList { client_id, query_id, playlist_id },
        ClientMessage::Retry => ServerMsg::Retry { client_id },
        ClientMessage::Discard => ServerMsg::Discard { client_id },
        ClientMessage::List { query_id } => ServerMsg::List { client_id, query_id },
        ClientMessage::SessionList { query_id } => ServerMsg::SessionList { client_id, query_id },
        ClientMessage::LoadAll { query_id, session, selection } => {
            ServerMsg::LoadAll { client_id, query_id, session, selection }
        }
    }
}

fn spawn_workers(
    config: &Config,
    to_server: crossbeam_channel::Sender<ServerMsg>,
    downloader: &Arc<dyn Downloader>,
) -> anyhow::Result<Vec<WorkerHandle>> {
    let mut handles = Vec::with_capacity(config.server.num_threads);
    for i in 0..config.server.num_threads {
        let name = format!("worker-{i}");
        let cookie_path = fan_out_cookie(&config.server.cookies, i)?;
        let (inbox, rx) = crossbeam_channel::unbounded::<WorkerMsg>();
        let join = worker::spawn(name.clone(), rx, to_server.clone(), cookie_path.clone(), Arc::clone(downloader));
        handles.push(WorkerHandle { name, cookie_path, inbox, join: Some(join) });
    }
    Ok(handles)
}

/// Each worker gets its own copy of the cookie file so a download in
/// progress never races a different worker's use of the same path; the
/// copies live in the OS temp directory and are fanned back into the
/// canonical file by [`merge_cookie_files`] once every worker has exited.
fn fan_out_cookie(canonical: &std::path::Path, worker_index: usize) -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join("jobd-cookies");
    std::fs::create_dir_all(&dir).context("creating cookie fan-out directory")?;
    let dest = dir.join(format!("worker-{worker_index}.cookies"));
    if canonical.exists() {
        std::fs::copy(canonical, &dest).with_context(|| format!("copying cookie file for worker {worker_index}"))?;
    }
    Ok(dest)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[ntest::timeout(1000)]
    fn fan_out_cookie_copies_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().join("cookies.txt");
        std::fs::write(&canonical, b"session=abc").unwrap();

        let dest = fan_out_cookie(&canonical, 0).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"session=abc");
    }

    #[test]
    #[ntest::timeout(1000)]
    fn fan_out_cookie_tolerates_missing_canonical_file() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().join("does-not-exist.txt");

        let dest = fan_out_cookie(&canonical, 1).unwrap();
        assert!(!dest.exists());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn merge_cookie_files_concatenates_non_comment_lines_and_removes_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().join("cookies.txt");
        let a = tmp.path().join("a.cookies");
        let b = tmp.path().join("b.cookies");
        std::fs::write(&a, "# Netscape HTTP Cookie File\n.example.com\tTRUE\t/\tFALSE\t0\tsid\t1\n").unwrap();
        std::fs::write(&b, "# Netscape HTTP Cookie File\n.example.org\tTRUE\t/\tFALSE\t0\tsid\t2\n").unwrap();

        merge_cookie_files(&canonical, &[a.clone(), b.clone()]).unwrap();

        let merged = std::fs::read_to_string(&canonical).unwrap();
        assert!(merged.starts_with("# Netscape HTTP Cookie File\n"));
        assert!(merged.contains(".example.com"));
        assert!(merged.contains(".example.org"));
        assert_eq!(merged.matches("# Netscape HTTP Cookie File").count(), 1);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    #[ntest::timeout(1000)]
    fn merge_cookie_files_tolerates_a_missing_worker_file() {
        let tmp = tempfile::tempdir().unwrap();
        let canonical = tmp.path().join("cookies.txt");
        let missing = tmp.path().join("gone.cookies");

        merge_cookie_files(&canonical, &[missing]).unwrap();
        assert_eq!(std::fs::read_to_string(&canonical).unwrap(), "# Netscape HTTP Cookie File\n");
    }
}
