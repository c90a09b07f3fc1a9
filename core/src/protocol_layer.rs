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

//! Protocol layer (C3): bridges the transport's raw bytes and the typed
//! messages a subscriber (the server, or the client-library session) wants
//! to see. Owns one [`codec::Decoder`] per connection and tags every
//! decoded message with its sender before handing it off.

use std::collections::HashMap;
use std::sync::Mutex;

use jobd_protocol::ClientMessage;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::codec::Decoder;
use crate::transport::{ClientId, RawSubscriber};

/// An event delivered to the server or client session. Messages here are
/// always complete and decoded; the subscriber never sees partial bytes.
#[derive(Debug)]
pub enum ProtocolEvent<M> {
    Connected(ClientId),
    Disconnected(ClientId),
    Message(ClientId, M),
}

/// A protocol layer generic over the message type it decodes
/// (`ClientMessage` on the server side, `ServerMessage` on the client
/// side).
pub struct ProtocolLayer<M> {
    decoders: Mutex<HashMap<ClientId, Decoder>>,
    forward: Box<dyn Fn(ProtocolEvent<M>) + Send + Sync>,
}

impl<M: DeserializeOwned + Send + 'static> ProtocolLayer<M> {
    pub fn new(forward: impl Fn(ProtocolEvent<M>) + Send + Sync + 'static) -> Self {
        ProtocolLayer { decoders: Mutex::new(HashMap::new()), forward: Box::new(forward) }
    }
}

impl<M: DeserializeOwned + Send + 'static> RawSubscriber for ProtocolLayer<M> {
    fn on_connected(&self, cid: ClientId) {
        self.decoders.lock().unwrap().insert(cid, Decoder::new());
        (self.forward)(ProtocolEvent::Connected(cid));
    }

    fn on_disconnected(&self, cid: ClientId) {
        self.decoders.lock().unwrap().remove(&cid);
        (self.forward)(ProtocolEvent::Disconnected(cid));
    }

    fn on_bytes(&self, cid: ClientId, bytes: &[u8]) {
        let messages = {
            let mut decoders = self.decoders.lock().unwrap();
            let decoder = decoders.entry(cid).or_insert_with(Decoder::new);
            decoder.push::<M>(bytes)
        };
        for result in messages {
            match result {
                Ok(msg) => (self.forward)(ProtocolEvent::Message(cid, msg)),
                Err(e) => warn!(cid, "discarding malformed frame: {}", e),
            }
        }
    }
}

/// Marker trait used only to give `ClientMessage` a friendlier alias at
/// call sites; the server's protocol layer is a `ProtocolLayer<ClientMessage>`.
pub type ServerProtocolLayer = ProtocolLayer<ClientMessage>;
