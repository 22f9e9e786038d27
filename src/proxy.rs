use super::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub miners: usize,
    pub connections: usize,
}

/// The entry point: accepts WebSocket miners, binds each to an upstream
/// connection (and donation connections), and owns the pool's lifecycle.
pub struct Proxy {
    settings: Arc<Settings>,
    pool: Pool,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            pool: Pool::new(settings.clone()),
            settings,
            cancel: CancellationToken::new(),
        })
    }

    /// Bind the HTTP(S) server, mount the WebSocket acceptor and the stats
    /// endpoint, and start the purge timer. Returns the bound address and
    /// the serve task.
    pub async fn listen(self: &Arc<Self>) -> Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
        if let Some(interval) = self.settings.purge_interval() {
            let proxy = self.clone();

            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = proxy.cancel.cancelled() => break,
                        _ = timer.tick() => proxy.pool.purge(),
                    }
                }
            });
        }

        http_server::spawn(&self.settings, api::router(self.clone()), self.cancel.clone()).await
    }

    /// Tear down every connection and miner and stop the acceptor.
    pub fn kill(&self) {
        info!("Shutting down proxy");
        self.cancel.cancel();
        self.pool.kill();
    }

    pub fn purge(&self) {
        self.pool.purge();
    }

    pub fn stats(&self) -> Stats {
        Stats {
            miners: self.pool.miners(),
            connections: self.pool.connection_count(),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Serve one WebSocket miner to completion.
    pub(crate) async fn accept(self: Arc<Self>, downstream: impl Downstream, query: Option<String>) {
        let binding = self.settings.binding(query.as_deref());

        let upstream = match self
            .pool
            .connection(&binding.host, binding.port, binding.ssl, false)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                warn!("no upstream connection for {}:{}: {err:#}", binding.host, binding.port);
                return;
            }
        };

        let mut donations = Vec::new();

        for config in self.settings.donations() {
            match self
                .pool
                .connection(&config.host, config.port, false, true)
                .await
            {
                Ok(connection) => {
                    donations.push((self.pool.next_session_id(), config.clone(), connection));
                }
                Err(err) => {
                    warn!(
                        "no donation connection for {}:{}: {err:#}",
                        config.host, config.port
                    );
                }
            }
        }

        let id = self.pool.next_session_id();

        info!("miner {id} connected to {}:{}", binding.host, binding.port);

        let mut miner = Miner::new(
            id,
            downstream,
            upstream,
            binding.pass,
            donations,
            self.settings.clone(),
            self.cancel.child_token(),
        );

        if let Err(err) = miner.serve().await {
            warn!("miner {id} failed: {err:#}");
        }
    }
}
