use {
    anyhow::{Context, Error, bail, ensure},
    arguments::Arguments,
    axum::{
        Json, Router,
        extract::{
            Query, State,
            ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        },
        response::Response,
        routing::{any, get},
    },
    axum_server::Handle,
    clap::Parser,
    derive_more::Display,
    difficulty::Difficulty,
    donation::{Donation, DonationConfig},
    futures::{SinkExt, StreamExt},
    job::Job,
    miner::{Downstream, Miner},
    pool::Pool,
    primitive_types::U256,
    rpc::{Id, Message},
    serde::{
        Deserialize, Serialize,
        de::{self, Deserializer},
    },
    serde_json::{Value, json},
    std::{
        collections::HashMap,
        env,
        fmt::{self, Display, Formatter},
        io,
        net::SocketAddr,
        path::PathBuf,
        process,
        str::FromStr,
        sync::{
            Arc, LazyLock,
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpStream,
        runtime::Runtime,
        signal::ctrl_c,
        sync::mpsc,
        task::JoinHandle,
        time::{Instant, interval_at},
    },
    tokio_util::{
        codec::{FramedRead, FramedWrite, LinesCodec},
        sync::CancellationToken,
    },
    tracing::{debug, error, info, warn},
    tracing_subscriber::EnvFilter,
    upstream::{Event, Mail, RequestKind, SessionHandle, SessionId, Source, Upstream},
};

pub use {
    options::Options,
    proxy::{Proxy, Stats},
    settings::Settings,
};

mod api;
mod arguments;
mod difficulty;
mod donation;
#[cfg(test)]
mod harness;
mod http_server;
mod job;
mod miner;
mod options;
mod pool;
mod proxy;
mod rpc;
mod settings;
mod upstream;

pub const USER_AGENT: &str = concat!("hivegate/", env!("CARGO_PKG_VERSION"));

pub(crate) const MAX_MESSAGE_SIZE: usize = 8 * 1024;

pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Nominal wall-clock length of one job turn, the unit the donation ledger
/// accrues and settles in.
pub(crate) const JOB_TIME: Duration = Duration::from_secs(30);

type Result<T = (), E = Error> = std::result::Result<T, E>;

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    match args.run() {
        Err(err) => {
            error!("error: {err}");

            if env::var_os("RUST_BACKTRACE")
                .map(|val| val == "1")
                .unwrap_or_default()
            {
                error!("{}", err.backtrace());
            }
            process::exit(1);
        }
        Ok(_) => {
            process::exit(0);
        }
    }
}
