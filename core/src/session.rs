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

//! Client-library session (C6): what a CLI invocation (or any other
//! embedder) uses to talk to a running server over one TCP connection.
//! Correlates replies to requests by `QueryId` and applies the three-tier
//! timeout policy from the configuration (§6).

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use crossbeam_channel::{bounded, Receiver, Sender};
use jobd_protocol::{ClientMessage, QueryId, ServerMessage};
use tracing::warn;

use crate::codec;
use crate::config::ClientConfig;
use crate::protocol_layer::{ProtocolEvent, ProtocolLayer};
use crate::transport::RawSubscriber;

/// Which of the three configured timeouts a request should be held to.
/// `List`-shaped requests that may enumerate a large session use `Long`;
/// fire-and-forget requests that still want a best-effort ack use `Short`.
pub enum TimeoutClass {
    Normal,
    Long,
    Short,
}

enum Pending {
    /// Exactly one reply is expected; delivering it clears the entry.
    Single(Sender<ServerMessage>),
    /// An `AddList` expansion may emit many replies for the same
    /// `query_id` (§4.5, §9); the entry stays registered until the
    /// caller explicitly stops listening via [`Session::request_stream`].
    Stream(Sender<ServerMessage>),
}

struct Inner {
    stream: Mutex<TcpStream>,
    pending: Mutex<HashMap<QueryId, Pending>>,
    next_query_id: AtomicU64,
    disconnected: Mutex<Option<String>>,
}

/// A single connection to the server plus the bookkeeping needed to match
/// replies back to the calls that requested them.
pub struct Session {
    inner: Arc<Inner>,
    config: ClientConfig,
}

impl Session {
    pub fn connect(addr: &str, config: ClientConfig) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).with_context(|| format!("connecting to {}", addr))?;
        let reader_stream = stream.try_clone().context("cloning session stream")?;

        let inner = Arc::new(Inner {
            stream: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(1),
            disconnected: Mutex::new(None),
        });

        let dispatch_inner = Arc::clone(&inner);
        let layer: Arc<dyn RawSubscriber> = Arc::new(ProtocolLayer::<ServerMessage>::new(move |event| {
            match event {
                ProtocolEvent::Message(_cid, ServerMessage::Response { query_id, text }) => {
                    dispatch_inner.deliver(query_id, ServerMessage::Response { query_id, text });
                }
                ProtocolEvent::Disconnected(_cid) => {
                    dispatch_inner.mark_disconnected("server closed the connection");
                }
                ProtocolEvent::Connected(_cid) => {}
            }
        }));
        // the protocol layer is keyed by ClientId but a session only ever
        // has one peer, so it is always addressed as 0.
        layer.on_connected(0);

        std::thread::spawn(move || {
            let mut buf = [0u8; 16 * 1024];
            let mut stream = reader_stream;
            loop {
                match std::io::Read::read(&mut stream, &mut buf) {
                    Ok(0) => {
                        layer.on_disconnected(0);
                        break;
                    }
                    Ok(n) => layer.on_bytes(0, &buf[..n]),
                    Err(e) => {
                        warn!("session read error: {:?}", e);
                        layer.on_disconnected(0);
                        break;
                    }
                }
            }
        });

        let session = Session { inner, config };
        let client_key = load_or_create_client_key(&session.config.identity_file)?;
        session.fire_and_forget(&ClientMessage::Hello { client_key })?;
        Ok(session)
    }

    fn timeout_for(&self, class: &TimeoutClass) -> Duration {
        let secs = match class {
            TimeoutClass::Normal => self.config.response_timeout_sec,
            TimeoutClass::Long => self.config.long_response_timeout_sec,
            TimeoutClass::Short => self.config.short_response_timeout_sec,
        };
        Duration::from_secs_f64(secs)
    }

    /// Sends a request that expects a `Response`, blocking for up to the
    /// class's configured timeout.
    pub fn request(&self, build: impl FnOnce(QueryId) -> ClientMessage, class: TimeoutClass) -> anyhow::Result<String> {
        if let Some(reason) = self.inner.disconnected.lock().unwrap().clone() {
            bail!("session is disconnected: {}", reason);
        }
        let query_id = self.inner.next_query_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = bounded(1);
        self.inner.pending.lock().unwrap().insert(query_id, Pending::Single(tx));

        let msg = build(query_id);
        self.send_frame(&msg)?;

        match self.wait(&rx, self.timeout_for(&class)) {
            Ok(ServerMessage::Response { text, .. }) => Ok(text),
            Err(e) => {
                self.inner.pending.lock().unwrap().remove(&query_id);
                Err(e)
            }
        }
    }

    /// Sends a request that may draw more than one `Response` for the same
    /// `query_id` (only `AddList` does this today, per §4.5/§9). Blocks for
    /// `class`'s timeout waiting for the first reply, then keeps draining
    /// further replies with a short grace period between each, stopping as
    /// soon as that gap elapses without a new one — the same "at least one,
    /// then best-effort more" shape the shell client uses for a playlist
    /// add.
    pub fn request_stream(
        &self,
        build: impl FnOnce(QueryId) -> ClientMessage,
        class: TimeoutClass,
    ) -> anyhow::Result<Vec<String>> {
        if let Some(reason) = self.inner.disconnected.lock().unwrap().clone() {
            bail!("session is disconnected: {}", reason);
        }
        let query_id = self.inner.next_query_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.pending.lock().unwrap().insert(query_id, Pending::Stream(tx));

        let msg = build(query_id);
        self.send_frame(&msg)?;

        let first = match self.wait(&rx, self.timeout_for(&class)) {
            Ok(ServerMessage::Response { text, .. }) => text,
            Err(e) => {
                self.inner.pending.lock().unwrap().remove(&query_id);
                return Err(e);
            }
        };

        let mut texts = vec![first];
        let gap = self.timeout_for(&TimeoutClass::Short);
        loop {
            match rx.recv_timeout(gap) {
                Ok(ServerMessage::Response { text, .. }) => texts.push(text),
                Err(_) => break,
            }
        }
        self.inner.pending.lock().unwrap().remove(&query_id);
        Ok(texts)
    }

    /// Sends a request with no reply to wait for (`Retry`/`Discard`).
    pub fn fire_and_forget(&self, msg: &ClientMessage) -> anyhow::Result<()> {
        self.send_frame(msg)
    }

    fn send_frame(&self, msg: &ClientMessage) -> anyhow::Result<()> {
        let bytes = codec::encode_frame(msg)?;
        let mut stream = self.inner.stream.lock().unwrap();
        stream.write_all(&bytes).context("writing request frame")
    }

    fn wait(&self, rx: &Receiver<ServerMessage>, timeout: Duration) -> anyhow::Result<ServerMessage> {
        match rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(_) => {
                if let Some(reason) = self.inner.disconnected.lock().unwrap().clone() {
                    bail!("session is disconnected: {}", reason);
                }
                bail!("timed out waiting for a response")
            }
        }
    }
}

impl Inner {
    fn deliver(&self, query_id: QueryId, msg: ServerMessage) {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(&query_id) {
            // A Stream entry stays registered: an AddList expansion may
            // still have more replies coming for this query_id.
            Some(Pending::Stream(tx)) => {
                let _ = tx.send(msg);
            }
            Some(Pending::Single(_)) => {
                if let Some(Pending::Single(tx)) = pending.remove(&query_id) {
                    let _ = tx.send(msg);
                }
            }
            // ProtocolViolation (§7): a response for a query_id nobody is
            // waiting on anymore (already timed out, or never ours).
            // Dropped with a warning; the connection stays open.
            None => warn!(query_id, "dropping response for unregistered query id"),
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        *self.disconnected.lock().unwrap() = Some(reason.to_string());
        // every outstanding request is now unanswerable; drop the senders
        // so their receivers wake with a disconnect error instead of
        // hanging until the request's own timeout elapses.
        self.pending.lock().unwrap().clear();
    }
}

/// Loads this machine's persistent client identity token from `path`,
/// generating and caching a new one on first use. Every connection sends
/// this token in a `Hello` so the daemon can recognize the same logical
/// client across separate one-shot CLI invocations that share `path`.
fn load_or_create_client_key(path: &Path) -> anyhow::Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let key = existing.trim();
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    let key = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    std::fs::write(path, &key).with_context(|| format!("writing client identity file {:?}", path))?;
    Ok(key)
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpListener;

    use super::*;
    use crate::codec::Decoder;

    fn fast_client_config() -> ClientConfig {
        ClientConfig {
            response_timeout_sec: 1.0,
            long_response_timeout_sec: 1.0,
            short_response_timeout_sec: 0.1,
            identity_file: std::env::temp_dir().join(format!("jobd-test-identity-{}", uuid::Uuid::new_v4())),
        }
    }

    /// Spawns a one-shot fake server that decodes exactly one
    /// `ClientMessage` then replies with `replies_per_request` `Response`
    /// frames, all for the query_id the client sent, before closing.
    fn fake_server(replies_per_request: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut decoder = Decoder::new();
            let mut buf = [0u8; 1024];
            let query_id: QueryId = 'outer: loop {
                let n = stream.read(&mut buf).unwrap();
                for msg in decoder.push::<ClientMessage>(&buf[..n]) {
                    match msg.unwrap() {
                        ClientMessage::Hello { .. } => {}
                        ClientMessage::AddCode { query_id, .. } => break 'outer query_id,
                        ClientMessage::AddList { query_id, .. } => break 'outer query_id,
                        _ => unreachable!("test only sends Hello/AddCode/AddList"),
                    }
                }
            };
            for i in 0..replies_per_request {
                let msg = ServerMessage::Response { query_id, text: format!("reply-{i}") };
                stream.write_all(&codec::encode_frame(&msg).unwrap()).unwrap();
            }
        });
        addr
    }

    #[test]
    #[ntest::timeout(3000)]
    fn request_returns_the_single_reply() {
        let addr = fake_server(1);
        let session = Session::connect(&addr, fast_client_config()).unwrap();
        let text = session
            .request(|query_id| ClientMessage::AddCode { query_id, item_id: "aaaaaaaaaaa".to_string() }, TimeoutClass::Normal)
            .unwrap();
        assert_eq!(text, "reply-0");
    }

    #[test]
    #[ntest::timeout(3000)]
    fn request_stream_collects_every_reply_for_the_same_query_id() {
        let addr = fake_server(3);
        let session = Session::connect(&addr, fast_client_config()).unwrap();
        let texts = session
            .request_stream(
                |query_id| ClientMessage::AddList { query_id, playlist_id: "p".repeat(34) },
                TimeoutClass::Normal,
            )
            .unwrap();
        assert_eq!(texts, vec!["reply-0", "reply-1", "reply-2"]);
    }

    #[test]
    #[ntest::timeout(3000)]
    fn request_times_out_when_the_server_never_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            // accept and hold the connection open without ever replying
            let (_stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_secs(5));
        });
        let session = Session::connect(&addr, fast_client_config()).unwrap();
        let res = session.request(|query_id| ClientMessage::AddCode { query_id, item_id: "aaaaaaaaaaa".to_string() }, TimeoutClass::Normal);
        assert!(res.is_err());
    }
}
