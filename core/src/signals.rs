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

//! Turns `SIGTERM`/`SIGINT` into a single [`ServerMsg::Stop`] so the
//! cancellation sequence (§5) runs on the server's own thread rather than
//! inside the signal handler itself.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use crossbeam_channel::Sender;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::{flag, iterator::Signals};
use tracing::info;

use crate::server::ServerMsg;

pub struct Handler;

impl Handler {
    /// Spawns a thread that blocks on the registered signals and, on the
    /// first one received, sends `Stop` to the server's mailbox and
    /// returns. A second signal arrives after `term_now` has been armed by
    /// `register`, so `register_conditional_shutdown` takes over and the
    /// process exits immediately rather than waiting on a graceful
    /// shutdown that may be stuck.
    pub fn spawn(to_server: Sender<ServerMsg>) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            flag::register(*sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));
                info!("received shutdown signal, asking the server to stop");
                let _ = to_server.send(ServerMsg::Stop);
                return;
            }
        });

        Ok(())
    }
}
