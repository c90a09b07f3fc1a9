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

//! Framed byte-stream transport (C1): a listening TCP socket that assigns
//! each accepted connection the next [`ClientId`] and runs an independent
//! read loop for it, plus a connection table that a writer side can use to
//! send bytes back to any still-connected client.
//!
//! This module speaks raw bytes only; turning those bytes into typed
//! messages is the protocol layer's job (C3, see [`crate::protocol_layer`]).

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::consts;

pub type ClientId = usize;

/// A callback invoked by the transport for every byte-level event. The
/// protocol layer is the only intended implementor of this trait; it is a
/// trait rather than a channel so the transport does not need to know the
/// shape of decoded messages.
pub trait RawSubscriber: Send + Sync {
    fn on_connected(&self, cid: ClientId);
    fn on_disconnected(&self, cid: ClientId);
    fn on_bytes(&self, cid: ClientId, bytes: &[u8]);
}

/// Shared, mutex-guarded connection table. A disconnected slot stores
/// `None` so that `ClientId` indices never shift.
pub struct Transport {
    connections: Mutex<Vec<Option<TcpStream>>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl Transport {
    pub fn new() -> Arc<Self> {
        Arc::new(Transport {
            connections: Mutex::new(Vec::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Binds a listening socket. Failure here is a `TransportError` and is
    /// fatal at startup.
    pub fn bind(addr: &str) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding to {}", addr))?;
        // non-blocking so the accept loop can poll `stopped` on a timeout
        // instead of blocking in accept() forever.
        listener.set_nonblocking(true).context("configuring listener")?;
        Ok(listener)
    }

    /// Runs the accept loop until `stop` is called. Each accepted
    /// connection gets the next `ClientId` and its own read-loop thread.
    /// The accept loop itself polls with a timeout so it notices shutdown
    /// without needing a separate wakeup mechanism.
    pub fn serve(self: &Arc<Self>, listener: TcpListener, subscriber: Arc<dyn RawSubscriber>) {
        loop {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        error!("clearing nonblocking on accepted stream: {:?}", e);
                        continue;
                    }
                    let cid = {
                        let mut conns = self.connections.lock().unwrap();
                        conns.push(Some(stream.try_clone().expect("cloning accepted stream")));
                        conns.len() - 1
                    };
                    info!(cid, "accepted connection");
                    subscriber.on_connected(cid);

                    let transport = Arc::clone(self);
                    let subscriber = Arc::clone(&subscriber);
                    thread::spawn(move || {
                        transport.read_loop(cid, stream, subscriber);
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(consts::POLL_TIMEOUT);
                }
                Err(err) => {
                    error!("accepting connection: {:?}", err);
                }
            }
        }
    }

    fn read_loop(&self, cid: ClientId, mut stream: TcpStream, subscriber: Arc<dyn RawSubscriber>) {
        if let Err(e) = stream.set_read_timeout(Some(consts::POLL_TIMEOUT)) {
            error!(cid, "setting read timeout: {:?}", e);
            return;
        }

        let mut buf = vec![0u8; consts::BUF_SIZE];
        loop {
            if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) => {
                    info!(cid, "peer closed connection");
                    break;
                }
                Ok(n) => {
                    subscriber.on_bytes(cid, &buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    warn!(cid, "read error, tearing down connection: {:?}", e);
                    break;
                }
            }
        }

        let mut conns = self.connections.lock().unwrap();
        if let Some(slot) = conns.get_mut(cid) {
            *slot = None;
        }
        drop(conns);
        subscriber.on_disconnected(cid);
    }

    /// Writes the full payload to `target`. Drops silently (with a warning)
    /// if the peer is gone.
    pub fn send(&self, target: ClientId, payload: &[u8]) {
        let mut conns = self.connections.lock().unwrap();
        match conns.get_mut(target) {
            Some(Some(stream)) => {
                if let Err(e) = stream.write_all(payload) {
                    warn!(cid = target, "send failed, dropping: {:?}", e);
                }
            }
            _ => {
                warn!(cid = target, "send to disconnected/unknown client dropped");
            }
        }
    }

    /// Writes the same payload to every currently-connected client (§4.1's
    /// `target: ClientId | all`). The server never exercises this today —
    /// every `Response` is addressed to a single `Sender` — but it is part
    /// of this component's documented contract, not an internal server
    /// concern, so it lives here rather than on `Server`.
    pub fn send_all(&self, payload: &[u8]) {
        let mut conns = self.connections.lock().unwrap();
        for (cid, slot) in conns.iter_mut().enumerate() {
            if let Some(stream) = slot {
                if let Err(e) = stream.write_all(payload) {
                    warn!(cid, "broadcast send failed, dropping: {:?}", e);
                }
            }
        }
    }

    /// Stops the accept loop and tears down every open connection. Read
    /// loops notice `stopped` within one poll timeout and exit on their
    /// own; this method also actively closes sockets so they do not linger
    /// waiting for more bytes.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        let conns = self.connections.lock().unwrap();
        for conn in conns.iter().flatten() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<ClientId>>,
        disconnected: Mutex<Vec<ClientId>>,
        bytes: Mutex<Vec<(ClientId, Vec<u8>)>>,
    }

    impl RawSubscriber for Recorder {
        fn on_connected(&self, cid: ClientId) {
            self.connected.lock().unwrap().push(cid);
        }
        fn on_disconnected(&self, cid: ClientId) {
            self.disconnected.lock().unwrap().push(cid);
        }
        fn on_bytes(&self, cid: ClientId, bytes: &[u8]) {
            self.bytes.lock().unwrap().push((cid, bytes.to_vec()));
        }
    }

    fn start_server() -> (Arc<Transport>, Arc<Recorder>, String) {
        let transport = Transport::new();
        let listener = Transport::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let recorder = Arc::new(Recorder::default());
        let serve_transport = Arc::clone(&transport);
        let serve_subscriber: Arc<dyn RawSubscriber> = Arc::clone(&recorder) as Arc<dyn RawSubscriber>;
        std::thread::spawn(move || {
            serve_transport.serve(listener, serve_subscriber);
        });
        (transport, recorder, addr)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..50 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition never became true");
    }

    /// Property: accepted connections get sequential ids, and a client's
    /// bytes are delivered tagged with its own id.
    #[test]
    #[ntest::timeout(3000)]
    fn accepted_clients_get_sequential_ids_and_tagged_bytes() {
        let (transport, recorder, addr) = start_server();

        let mut a = TcpStream::connect(&addr).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 1);
        let mut b = TcpStream::connect(&addr).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 2);

        assert_eq!(*recorder.connected.lock().unwrap(), vec![0, 1]);

        a.write_all(b"hello-a").unwrap();
        wait_until(|| !recorder.bytes.lock().unwrap().is_empty());
        let (cid, bytes) = recorder.bytes.lock().unwrap().remove(0);
        assert_eq!(cid, 0);
        assert_eq!(bytes, b"hello-a");

        transport.stop();
        drop(b);
    }

    /// Property: `send` reaches only the addressed client.
    #[test]
    #[ntest::timeout(3000)]
    fn send_reaches_only_the_addressed_client() {
        let (transport, recorder, addr) = start_server();

        let mut a = TcpStream::connect(&addr).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut b = TcpStream::connect(&addr).unwrap();
        b.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 2);

        transport.send(0, b"for-a-only");

        let mut buf = [0u8; 32];
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"for-a-only");

        let mut buf_b = [0u8; 32];
        let err = b.read(&mut buf_b);
        assert!(err.is_err(), "client 1 should not have received anything");

        transport.stop();
    }

    /// Property: `send_all` reaches every connected client.
    #[test]
    #[ntest::timeout(3000)]
    fn send_all_reaches_every_connected_client() {
        let (transport, recorder, addr) = start_server();

        let mut a = TcpStream::connect(&addr).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut b = TcpStream::connect(&addr).unwrap();
        b.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 2);

        transport.send_all(b"broadcast");

        let mut buf_a = [0u8; 32];
        let n = a.read(&mut buf_a).unwrap();
        assert_eq!(&buf_a[..n], b"broadcast");

        let mut buf_b = [0u8; 32];
        let n = b.read(&mut buf_b).unwrap();
        assert_eq!(&buf_b[..n], b"broadcast");

        transport.stop();
    }

    /// Property: a disconnected client's slot becomes `None` without
    /// shifting the ids already assigned to other clients.
    #[test]
    #[ntest::timeout(3000)]
    fn disconnect_nulls_the_slot_without_shifting_ids() {
        let (transport, recorder, addr) = start_server();

        let a = TcpStream::connect(&addr).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 1);
        let _b = TcpStream::connect(&addr).unwrap();
        wait_until(|| recorder.connected.lock().unwrap().len() == 2);

        drop(a);
        wait_until(|| !recorder.disconnected.lock().unwrap().is_empty());
        assert_eq!(*recorder.disconnected.lock().unwrap(), vec![0]);

        // client 1's id is still valid and reachable
        transport.send(1, b"still-here");

        transport.stop();
    }
}
