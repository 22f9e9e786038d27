use {super::*, parking_lot::Mutex};

/// Keyed pool of upstream connections. Within a key connections are
/// interchangeable; selection takes the most recently created one with
/// capacity, so older connections drain and the purge can reap them.
pub(crate) struct Pool {
    settings: Arc<Settings>,
    connections: Mutex<HashMap<String, Vec<Upstream>>>,
    next_connection: AtomicU64,
    next_session: AtomicU64,
}

impl Pool {
    pub(crate) fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            next_session: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn connection(
        &self,
        host: &str,
        port: u16,
        ssl: bool,
        donation: bool,
    ) -> Result<Upstream> {
        let key = format!("{host}:{port}");
        let max = self.settings.max_miners_per_connection();

        let existing = {
            let mut connections = self.connections.lock();
            let slot = connections.entry(key.clone()).or_default();

            slot.retain(|connection| connection.is_open() || !connection.is_empty());

            slot.iter()
                .rev()
                .find(|connection| connection.is_open() && connection.available(max))
                .cloned()
        };

        if let Some(connection) = existing {
            return Ok(connection);
        }

        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);

        let connection = Upstream::connect(id, host, port, ssl, donation, self.settings.timeout())
            .await
            .with_context(|| format!("failed to connect to {key}"))?;

        debug_assert!(connection.available(max), "a fresh connection has capacity");

        self.connections
            .lock()
            .entry(key)
            .or_default()
            .push(connection.clone());

        Ok(connection)
    }

    /// Keep at most one empty connection per key; kill the rest and drop
    /// whatever has died and drained.
    pub(crate) fn purge(&self) {
        let mut connections = self.connections.lock();

        for slot in connections.values_mut() {
            let mut kept_empty = false;

            slot.retain(|connection| {
                if !connection.is_open() {
                    return !connection.is_empty();
                }

                if !connection.is_empty() {
                    return true;
                }

                if kept_empty {
                    debug!("purging idle connection {} to {}", connection.id(), connection.key());
                    connection.kill();
                    false
                } else {
                    kept_empty = true;
                    true
                }
            });
        }

        connections.retain(|_, slot| !slot.is_empty());
    }

    pub(crate) fn kill(&self) {
        let mut connections = self.connections.lock();

        for connection in connections.values().flatten() {
            connection.kill();
        }

        connections.clear();
    }

    pub(crate) fn miners(&self) -> usize {
        self.connections
            .lock()
            .values()
            .flatten()
            .map(Upstream::miners)
            .sum()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .flatten()
            .filter(|connection| !connection.is_donation())
            .count()
    }
}
