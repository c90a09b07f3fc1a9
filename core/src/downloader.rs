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

//! The external downloader: an opaque collaborator this crate does not
//! implement. `download` and `expand_playlist` are named and shaped by the
//! spec but their actual network logic is out of scope here.

use std::collections::HashSet;
use std::path::Path;

use jobd_protocol::{ItemId, PlaylistId};

/// Authentication cookie handling is delegated to the downloader via the
/// path parameter each method takes; this crate never reads or interprets
/// cookie file contents.
pub trait Downloader: Send + Sync {
    /// Retrieves a single item. `Ok(())` on success, `Err(message)` on
    /// failure (the message is recorded in the server log and surfaced to
    /// the owning client via a later `List`).
    fn download(&self, item: &ItemId, cookie_path: &Path) -> Result<(), String>;

    /// Expands a playlist into its constituent item ids.
    fn expand_playlist(
        &self,
        playlist: &PlaylistId,
        cookie_path: &Path,
    ) -> Result<HashSet<ItemId>, String>;
}

/// A downloader that always fails. Useful as a safe default before a real
/// integration is wired in, and for exercising the `Failed` path in tests
/// without touching the network.
pub struct NullDownloader;

impl Downloader for NullDownloader {
    fn download(&self, _item: &ItemId, _cookie_path: &Path) -> Result<(), String> {
        Err("no downloader configured".to_string())
    }

    fn expand_playlist(
        &self,
        _playlist: &PlaylistId,
        _cookie_path: &Path,
    ) -> Result<HashSet<ItemId>, String> {
        Err("no downloader configured".to_string())
    }
}
