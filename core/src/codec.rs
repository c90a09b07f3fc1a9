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

//! The self-framing codec (C2): encodes a typed message into a
//! `START . body . END` frame, and decodes a byte stream fragmented into
//! arbitrary packet splits back into the original sequence of messages.

use anyhow::{anyhow, Context};
use jobd_protocol::{FRAME_END, FRAME_START};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes a single message into a complete frame.
pub fn encode_frame<M: Serialize>(msg: &M) -> anyhow::Result<Vec<u8>> {
    let body = rmp_serde::to_vec(msg).context("encoding message body")?;
    let mut frame = Vec::with_capacity(FRAME_START.len() + body.len() + FRAME_END.len());
    frame.extend_from_slice(&FRAME_START);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&FRAME_END);
    Ok(frame)
}

/// A decoder error for a single malformed frame. The caller should log and
/// discard the frame but keep the connection (and the decoder) alive, per
/// the protocol layer's contract.
#[derive(Debug)]
pub struct DecodeError(pub anyhow::Error);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

/// Reassembles frames out of a stream of arbitrarily-sized packets.
///
/// Each sender gets its own `Decoder` so that frames from different
/// connections never get interleaved. Feeding bytes into a decoder may
/// yield zero, one, or many complete messages depending on how much of
/// the stream has arrived so far.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder { buf: Vec::new() }
    }

    /// Appends newly-read bytes and extracts every complete frame now
    /// available. Partial tails remain buffered for the next call.
    pub fn push<M: DeserializeOwned>(
        &mut self,
        bytes: &[u8],
    ) -> Vec<Result<M, DecodeError>> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        loop {
            let Some(start) = find(&self.buf, &FRAME_START) else {
                // no start sentinel at all: drop any garbage that can
                // never become a frame, keep the last few bytes in case
                // they are a partial START
                let keep_from = self.buf.len().saturating_sub(FRAME_START.len() - 1);
                self.buf.drain(..keep_from);
                break;
            };
            if start > 0 {
                // discard garbage preceding the frame start
                self.buf.drain(..start);
            }

            let body_start = FRAME_START.len();
            let Some(end_rel) = find(&self.buf[body_start..], &FRAME_END) else {
                // START seen but the frame is not complete yet
                break;
            };
            let body_end = body_start + end_rel;
            let frame_end = body_end + FRAME_END.len();

            let body = &self.buf[body_start..body_end];
            let decoded = rmp_serde::from_slice::<M>(body)
                .map_err(|e| DecodeError(anyhow!("malformed frame body: {}", e)));
            out.push(decoded);

            self.buf.drain(..frame_end);
        }
        out
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;
    use jobd_protocol::ClientMessage;

    #[test]
    fn round_trip_single_frame() {
        let msg = ClientMessage::AddCode { query_id: 1, item_id: "ABCDEFGHIJK".to_string() };
        let frame = encode_frame(&msg).unwrap();

        let mut decoder = Decoder::new();
        let mut out = decoder.push::<ClientMessage>(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out.remove(0).unwrap(), msg);
    }

    #[test]
    fn frame_boundary_robustness_arbitrary_splits() {
        let msgs = vec![
            ClientMessage::AddCode { query_id: 1, item_id: "ABCDEFGHIJK".to_string() },
            ClientMessage::List { query_id: 2 },
            ClientMessage::Retry,
            ClientMessage::Discard,
            ClientMessage::AddList { query_id: 3, playlist_id: "P".repeat(34) },
        ];
        let mut all_bytes = Vec::new();
        for m in &msgs {
            all_bytes.extend(encode_frame(m).unwrap());
        }

        // split into arbitrary, uneven chunks
        let chunk_sizes = [1usize, 3, 7, 2, 5, 11, 1, 1000];
        let mut decoder = Decoder::new();
        let mut decoded = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < all_bytes.len() {
            let size = chunk_sizes[i % chunk_sizes.len()];
            let end = (pos + size).min(all_bytes.len());
            for r in decoder.push::<ClientMessage>(&all_bytes[pos..end]) {
                decoded.push(r.unwrap());
            }
            pos = end;
            i += 1;
        }

        assert_eq!(decoded, msgs);
    }

    #[test]
    fn malformed_body_is_reported_and_does_not_wedge_the_decoder() {
        let mut garbage = Vec::new();
        garbage.extend_from_slice(&FRAME_START);
        garbage.extend_from_slice(&[0xff, 0xff, 0xff]); // not valid msgpack for our types
        garbage.extend_from_slice(&FRAME_END);

        let good = ClientMessage::List { query_id: 42 };
        garbage.extend(encode_frame(&good).unwrap());

        let mut decoder = Decoder::new();
        let mut results = decoder.push::<ClientMessage>(&garbage);
        assert_eq!(results.len(), 2);
        assert!(results.remove(0).is_err());
        assert_eq!(results.remove(0).unwrap(), good);
    }
}
