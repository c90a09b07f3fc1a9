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

use std::io;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use jobd_protocol::LoadSelection;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod codec;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod downloader;
pub mod model;
pub mod persistence;
pub mod protocol_layer;
pub mod server;
pub mod session;
mod signals;
pub mod transport;
pub mod worker;

use session::{Session, TimeoutClass};

/// The command line arguments `jobd` expects.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "The file to write logs to; defaults to stderr")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Starts running the download daemon")]
    Daemon {
        #[clap(long, action, help = "Fork into the background after binding the listener")]
        daemonize: bool,
    },

    #[clap(about = "Queues a single item for download")]
    Add {
        #[clap(help = "The item id to download")]
        item_id: String,
    },

    #[clap(about = "Queues every item in a playlist for download")]
    AddList {
        #[clap(help = "The playlist id to expand and queue")]
        playlist_id: String,
    },

    #[clap(about = "Shows queued, running, finished and failed items for this client")]
    List,

    #[clap(about = "Requeues this client's failed items")]
    Retry,

    #[clap(about = "Discards this client's failed items without requeuing them")]
    Discard,

    #[clap(about = "Lists sessions saved on disk")]
    SessionList,

    #[clap(about = "Loads a saved session's items back onto the queue")]
    LoadAll {
        #[clap(help = "The session name, as printed by session-list")]
        session: String,
        #[clap(long, value_enum, default_value_t = SelectionArg::All, help = "Which subset of the session to load")]
        selection: SelectionArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SelectionArg {
    All,
    PendingOnly,
    FinishedOnly,
}

impl From<SelectionArg> for LoadSelection {
    fn from(s: SelectionArg) -> Self {
        match s {
            SelectionArg::All => LoadSelection::All,
            SelectionArg::PendingOnly => LoadSelection::PendingOnly,
            SelectionArg::FinishedOnly => LoadSelection::FinishedOnly,
        }
    }
}

/// Runs `jobd` with the given arguments. Exit codes follow the error
/// handling policy: `0` on success, `1` for a configuration problem, `2`
/// for everything else (a connection failure, a timed-out request, a
/// malformed reply).
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = std::fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon { .. } = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = match config::read_config(&args.config_file) {
        Ok(c) => c,
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    };

    let res = match args.command {
        Commands::Daemon { daemonize } => daemon::run(config, daemonize, None),
        Commands::Add { item_id } => with_session(&config, |session| {
            session.request(|query_id| jobd_protocol::ClientMessage::AddCode { query_id, item_id }, TimeoutClass::Normal)
        }),
        Commands::AddList { playlist_id } => with_session(&config, |session| {
            let texts = session.request_stream(
                |query_id| jobd_protocol::ClientMessage::AddList { query_id, playlist_id },
                TimeoutClass::Long,
            )?;
            Ok(texts.join("\n"))
        }),
        Commands::List => with_session(&config, |session| {
            session.request(|query_id| jobd_protocol::ClientMessage::List { query_id }, TimeoutClass::Long)
        }),
        Commands::Retry => with_session(&config, |session| {
            session.fire_and_forget(&jobd_protocol::ClientMessage::Retry)?;
            Ok("retry requested".to_string())
        }),
        Commands::Discard => with_session(&config, |session| {
            session.fire_and_forget(&jobd_protocol::ClientMessage::Discard)?;
            Ok("discard requested".to_string())
        }),
        Commands::SessionList => with_session(&config, |session| {
            session.request(|query_id| jobd_protocol::ClientMessage::SessionList { query_id }, TimeoutClass::Short)
        }),
        Commands::LoadAll { session: name, selection } => with_session(&config, |session| {
            session.request(
                |query_id| jobd_protocol::ClientMessage::LoadAll {
                    query_id,
                    session: name,
                    selection: selection.into(),
                },
                TimeoutClass::Long,
            )
        }),
    };

    match res {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(err) => {
            error!("{:?}", err);
            std::process::exit(2);
        }
    }
}

fn with_session(config: &config::Config, body: impl FnOnce(&Session) -> anyhow::Result<String>) -> anyhow::Result<String> {
    let addr = format!("{}:{}", config.comm.ip, config.comm.port);
    let session = Session::connect(&addr, config.client.clone()).context("connecting to jobd")?;
    body(&session)
}
