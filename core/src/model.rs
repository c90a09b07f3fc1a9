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

//! Shared data model (§3): `Job`, `ClientRecord`, and the four job-state
//! names, used by both the server (C5) and persistence (C7).

use jobd_protocol::ItemId;
use serde_derive::{Deserialize, Serialize};

pub use crate::transport::ClientId;

/// A `(ClientId, ItemId)` pair. Equality and hashing are over both fields:
/// the same item requested by two clients is two distinct jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub client_id: ClientId,
    pub item_id: ItemId,
}

impl Job {
    pub fn new(client_id: ClientId, item_id: ItemId) -> Self {
        Job { client_id, item_id }
    }
}

/// `(ClientId, connected)`. Created on connect, marked disconnected on
/// transport loss, never removed, so replies can still be addressed (and
/// dropped gracefully) after a client goes away.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub connected: bool,
}

/// The four job-state file names under a session directory.
pub const QUEUED: &str = "queued";
pub const RUNNING: &str = "running";
pub const FINISHED: &str = "finished";
pub const FAILED: &str = "failed";
