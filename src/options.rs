use super::*;

#[derive(Clone, Debug, Parser)]
pub struct Options {
    #[arg(long, help = "Forward miners to the pool at <HOST>.")]
    pub host: String,

    #[arg(long, help = "Forward miners to the pool on <PORT>.")]
    pub port: u16,

    #[arg(long, default_value = "x", help = "Authenticate upstream with <PASS>.")]
    pub pass: String,

    #[arg(long, help = "Connect upstream over TLS.")]
    pub ssl: bool,

    #[arg(long, help = "Replace every miner's login address with <ADDRESS>.")]
    pub address: Option<String>,

    #[arg(
        long,
        help = "Replace every miner's login with <USER>. Ignored when --address is set."
    )]
    pub user: Option<String>,

    #[arg(long, help = "Force job targets to difficulty <DIFF>.")]
    pub diff: Option<u64>,

    #[arg(
        long,
        help = "Let clients pick their pool with the `pool` query parameter."
    )]
    pub dynamic_pool: bool,

    #[arg(
        long,
        default_value_t = 100,
        help = "Assign at most <MAX_MINERS_PER_CONNECTION> miners to one upstream connection."
    )]
    pub max_miners_per_connection: usize,

    #[arg(
        long = "donation",
        value_name = "ADDRESS@HOST:PORT:PASS:PERCENTAGE",
        help = "Donate a share of every miner's job time. May be repeated."
    )]
    pub donations: Vec<DonationConfig>,

    #[arg(long, help = "Serve HTTPS/WSS with the PEM key at <KEY>.")]
    pub key: Option<PathBuf>,

    #[arg(long, help = "Serve HTTPS/WSS with the PEM certificate at <CERT>.")]
    pub cert: Option<PathBuf>,

    #[arg(long, default_value = "/", help = "Accept WebSockets at <PATH>.")]
    pub path: String,

    #[arg(
        long,
        default_value = "0.0.0.0",
        help = "Listen at <LISTEN_ADDRESS> for miners."
    )]
    pub listen_address: String,

    #[arg(
        long,
        default_value_t = 8892,
        help = "Listen on <LISTEN_PORT> for miners."
    )]
    pub listen_port: u16,

    #[arg(
        long,
        default_value_t = 0,
        help = "Purge idle upstream connections every <PURGE_INTERVAL> milliseconds. 0 disables."
    )]
    pub purge_interval: u64,

    #[arg(long, default_value_t = 30, help = "Upstream connection timeout in seconds.")]
    pub timeout: u64,
}
