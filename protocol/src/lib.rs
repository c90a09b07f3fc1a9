// Copyright 2024 Google LLC
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

//! Wire messages and frame sentinels shared by the daemon and its clients.
//!
//! A frame on the wire is `START . body . END`, where `body` is a
//! MessagePack-encoded [`ClientMessage`] or [`ServerMessage`]. This crate
//! only defines the shapes; the actual framing/decoding state machine lives
//! in `jobd-core`.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start-of-frame sentinel. Chosen so its leading byte (0xc1) is a
/// MessagePack "never used" byte, which cannot be the first byte any
/// encoder emits for a value this protocol ever frames.
pub const FRAME_START: [u8; 6] = [0xc1, b'J', b'O', b'B', b'D', 0xc1];

/// End-of-frame sentinel, five bytes, same reasoning as `FRAME_START`.
pub const FRAME_END: [u8; 5] = [0xc1, b'E', b'N', b'D', 0xc1];

/// An opaque item identifier: always 11 characters.
pub type ItemId = String;

/// An opaque playlist identifier: always 34 characters.
pub type PlaylistId = String;

/// Client-chosen correlation token linking a request with its reply.
pub type QueryId = u64;

/// The length an [`ItemId`] must have.
pub const ITEM_ID_LEN: usize = 11;

/// The length a [`PlaylistId`] must have.
pub const PLAYLIST_ID_LEN: usize = 34;

/// Messages a client sends to the daemon. Each variant that expects a
/// reply carries the `query_id` the daemon must echo back on every
/// [`ServerMessage::Response`] it sends in answer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Sent once, immediately after connecting, before any other request.
    /// Carries a token the connecting client generated and cached locally
    /// on a previous run. The daemon uses it to recognize the same logical
    /// client across separate connections, so that a one-shot CLI
    /// invocation's `List`/`Retry`/`Discard` can still see jobs a previous,
    /// already-disconnected invocation queued. Fire-and-forget: no reply.
    Hello { client_key: String },
    /// Queue a single item for download.
    AddCode { query_id: QueryId, item_id: ItemId },
    /// Expand a playlist and queue each of its items. The daemon replies
    /// once per expanded item, all reusing this same `query_id`.
    AddList { query_id: QueryId, playlist_id: PlaylistId },
    /// Move this client's failed jobs back into the queue. Fire-and-forget:
    /// no reply is sent.
    Retry,
    /// Drop this client's failed jobs. Fire-and-forget: no reply is sent.
    Discard,
    /// Ask for a formatted listing of this client's jobs.
    List { query_id: QueryId },
    /// Ask for the names of sessions that can be loaded from disk.
    SessionList { query_id: QueryId },
    /// Load a past session's job sets into the current run, merging them
    /// per `selection`.
    LoadAll { query_id: QueryId, session: String, selection: LoadSelection },
}

/// How a loaded session's job sets are merged into the current ones. See
/// the persistence component for the exact merge rules.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadSelection {
    /// Merge all four sets; anything that was `Running` is treated as
    /// unfinished and folded into `Queued`.
    #[default]
    All,
    /// Merge `Running` and `Queued` into `Queued`, and `Failed` into
    /// `Failed`. Skips `Finished`.
    PendingOnly,
    /// Merge only `Finished`.
    FinishedOnly,
}

impl fmt::Display for LoadSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSelection::All => write!(f, "all"),
            LoadSelection::PendingOnly => write!(f, "pending-only"),
            LoadSelection::FinishedOnly => write!(f, "finished-only"),
        }
    }
}

/// Messages the daemon sends to a client. The wire protocol in spec only
/// names `Response`; every reply the daemon ever sends uses this shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response { query_id: QueryId, text: String },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinels_do_not_overlap() {
        // a basic sanity check that START and END are distinct byte
        // sequences of the documented lengths
        assert_eq!(FRAME_START.len(), 6);
        assert_eq!(FRAME_END.len(), 5);
        assert_ne!(&FRAME_START[..], &FRAME_END[..]);
    }

    #[test]
    fn load_selection_default_is_all() {
        assert_eq!(LoadSelection::default(), LoadSelection::All);
    }
}
