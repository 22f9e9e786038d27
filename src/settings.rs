use super::*;

/// Where a miner's upstream traffic goes: the configured pool, unless the
/// client picked one with `?pool=` and dynamic pools are enabled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Binding {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) pass: String,
    pub(crate) ssl: bool,
}

#[derive(Clone, Debug)]
pub struct Settings {
    host: String,
    port: u16,
    pass: String,
    ssl: bool,
    address: Option<String>,
    user: Option<String>,
    diff: Option<Difficulty>,
    dynamic_pool: bool,
    max_miners_per_connection: usize,
    donations: Vec<DonationConfig>,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    path: String,
    listen_address: String,
    listen_port: u16,
    purge_interval: Option<Duration>,
    timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3333,
            pass: "x".into(),
            ssl: false,
            address: None,
            user: None,
            diff: None,
            dynamic_pool: false,
            max_miners_per_connection: 100,
            donations: Vec::new(),
            key: None,
            cert: None,
            path: "/".into(),
            listen_address: "0.0.0.0".into(),
            listen_port: 8892,
            purge_interval: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    pub fn from_options(options: Options) -> Result<Self> {
        ensure!(
            options.key.is_some() == options.cert.is_some(),
            "--key and --cert must be given together"
        );

        ensure!(
            options.path.starts_with('/'),
            "--path must start with `/`"
        );

        Ok(Self {
            host: options.host,
            port: options.port,
            pass: options.pass,
            ssl: options.ssl,
            address: options.address,
            user: options.user,
            diff: options.diff.map(Difficulty::from),
            dynamic_pool: options.dynamic_pool,
            max_miners_per_connection: options.max_miners_per_connection,
            donations: options.donations,
            key: options.key,
            cert: options.cert,
            path: options.path,
            listen_address: options.listen_address,
            listen_port: options.listen_port,
            purge_interval: match options.purge_interval {
                0 => None,
                millis => Some(Duration::from_millis(millis)),
            },
            timeout: Duration::from_secs(options.timeout),
        })
    }

    pub(crate) fn binding(&self, query: Option<&str>) -> Binding {
        let mut binding = Binding {
            host: self.host.clone(),
            port: self.port,
            pass: self.pass.clone(),
            ssl: self.ssl,
        };

        if !self.dynamic_pool {
            return binding;
        }

        let Some(query) = query else {
            return binding;
        };

        let mut parts = query.splitn(3, ':');

        if let Some(host) = parts.next()
            && !host.is_empty()
        {
            binding.host = host.into();
        }

        if let Some(port) = parts.next()
            && let Ok(port) = port.parse()
        {
            binding.port = port;
        }

        if let Some(pass) = parts.next()
            && !pass.is_empty()
        {
            binding.pass = pass.into();
        }

        binding
    }

    /// A fixed `address` takes precedence over a fixed `user`; either
    /// replaces the login the client sent.
    pub(crate) fn login_override(&self) -> Option<&str> {
        self.address.as_deref().or(self.user.as_deref())
    }

    pub(crate) fn diff(&self) -> Option<Difficulty> {
        self.diff
    }

    pub(crate) fn max_miners_per_connection(&self) -> usize {
        self.max_miners_per_connection
    }

    pub(crate) fn donations(&self) -> &[DonationConfig] {
        &self.donations
    }

    pub(crate) fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        Some((self.cert.as_ref()?, self.key.as_ref()?))
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub(crate) fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub(crate) fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_diff(mut self, diff: u64) -> Self {
        self.diff = Some(Difficulty::from(diff));
        self
    }

    #[cfg(test)]
    pub(crate) fn with_address(mut self, address: &str) -> Self {
        self.address = Some(address.into());
        self
    }

    #[cfg(test)]
    pub(crate) fn with_max_miners(mut self, max: usize) -> Self {
        self.max_miners_per_connection = max;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_dynamic_pool(mut self) -> Self {
        self.dynamic_pool = true;
        self
    }
}
