use {
    super::*,
    snafu::{ResultExt, Snafu},
    tokio_rustls::TlsConnector,
};

pub(crate) type SessionId = u64;

/// Which leg of a miner session a piece of mail belongs to. Donation mail is
/// tagged with the donation's index so one mailbox serves the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Host,
    Donation(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Login,
    Submit,
    Keepalive,
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Response {
        kind: RequestKind,
        id: Id,
        result: Option<Value>,
        error: Option<Value>,
    },
    Job(Job),
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct Mail {
    pub(crate) source: Source,
    pub(crate) event: Event,
}

/// The address a connection delivers to: one logical session (a miner or one
/// of its donations). Cheap to clone; the connection keeps one per
/// registered session and one per in-flight request.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) source: Source,
    tx: mpsc::UnboundedSender<Mail>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, source: Source, tx: mpsc::UnboundedSender<Mail>) -> Self {
        Self { id, source, tx }
    }

    pub(crate) fn is_donation(&self) -> bool {
        matches!(self.source, Source::Donation(_))
    }

    pub(crate) fn deliver(&self, event: Event) {
        let _ = self.tx.send(Mail {
            source: self.source,
            event,
        });
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum UpstreamError {
    #[snafu(display("connection timeout: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },

    #[snafu(display("io error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("invalid server name `{host}`"))]
    ServerName { host: String },

    #[snafu(display("connection closed"))]
    Closed,
}

pub(crate) enum Command {
    Send {
        session: SessionHandle,
        kind: RequestKind,
        id: Id,
        method: String,
        params: Value,
    },
    Register(SessionHandle),
    Unregister(SessionId),
    Shutdown,
}

/// Handle to one multiplexed TCP/TLS session with a pool. The socket and the
/// request registries live in a spawned [`Connection`] actor; the handle
/// carries the capacity counters so pool selection never crosses the actor
/// boundary.
#[derive(Clone)]
pub(crate) struct Upstream {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    host: String,
    port: u16,
    donation: bool,
    tx: mpsc::UnboundedSender<Command>,
    miners: AtomicUsize,
    donations: AtomicUsize,
    open: Arc<AtomicBool>,
}

impl Upstream {
    pub(crate) async fn connect(
        id: u64,
        host: &str,
        port: u16,
        ssl: bool,
        donation: bool,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let stream = dial(host, port, ssl, timeout).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let (reader, writer) = tokio::io::split(stream);

        let connection = Connection {
            id,
            rx,
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
            next_id: 0,
            pending: HashMap::new(),
            sessions: HashMap::new(),
            workers: HashMap::new(),
            open: open.clone(),
        };

        tokio::spawn(connection.run());

        info!("connection {id} to {host}:{port} open (ssl={ssl})");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                host: host.into(),
                port,
                donation,
                tx,
                miners: AtomicUsize::new(0),
                donations: AtomicUsize::new(0),
                open,
            }),
        })
    }

    /// Enqueue a request, rewriting its id on the way out. The caller's
    /// original id travels with the mapping and is restored on the response.
    pub(crate) fn send(
        &self,
        session: &SessionHandle,
        kind: RequestKind,
        id: Id,
        method: &str,
        params: Value,
    ) -> Result<(), UpstreamError> {
        self.command(Command::Send {
            session: session.clone(),
            kind,
            id,
            method: method.into(),
            params,
        })
    }

    pub(crate) fn register(&self, session: &SessionHandle) -> Result<(), UpstreamError> {
        self.command(Command::Register(session.clone()))?;

        if session.is_donation() {
            self.inner.donations.fetch_add(1, Ordering::SeqCst);
        } else {
            self.inner.miners.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Safe to call whether or not the connection is still open; the counter
    /// must drop either way so the pool sees the connection drain.
    pub(crate) fn unregister(&self, session: &SessionHandle) {
        if session.is_donation() {
            self.inner.donations.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.inner.miners.fetch_sub(1, Ordering::SeqCst);
        }

        let _ = self.inner.tx.send(Command::Unregister(session.id));
    }

    pub(crate) fn kill(&self) {
        let _ = self.inner.tx.send(Command::Shutdown);
    }

    fn command(&self, command: Command) -> Result<(), UpstreamError> {
        if !self.is_open() {
            return Err(UpstreamError::Closed);
        }

        self.inner
            .tx
            .send(command)
            .map_err(|_| UpstreamError::Closed)
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn key(&self) -> String {
        format!("{}:{}", self.inner.host, self.inner.port)
    }

    pub(crate) fn is_donation(&self) -> bool {
        self.inner.donation
    }

    pub(crate) fn miners(&self) -> usize {
        self.inner.miners.load(Ordering::SeqCst)
    }

    pub(crate) fn donations(&self) -> usize {
        self.inner.donations.load(Ordering::SeqCst)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.miners() == 0 && self.donations() == 0
    }

    /// Capacity check at assignment time. Miners and donations are capped
    /// independently rather than by their sum, matching the pool selection
    /// behavior miners observe in the wild.
    pub(crate) fn available(&self, max: usize) -> bool {
        self.miners() < max && self.donations() < max
    }
}

#[cfg(test)]
impl Upstream {
    /// A handle with no connection behind it, for exercising code that only
    /// touches the handle's accounting.
    pub(crate) fn stub(id: u64, donation: bool) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                inner: Arc::new(Inner {
                    id,
                    host: "stub".into(),
                    port: 0,
                    donation,
                    tx,
                    miners: AtomicUsize::new(0),
                    donations: AtomicUsize::new(0),
                    open: Arc::new(AtomicBool::new(true)),
                }),
            },
            rx,
        )
    }
}

struct PendingRequest {
    session: SessionHandle,
    kind: RequestKind,
    id: Id,
}

struct Connection {
    id: u64,
    rx: mpsc::UnboundedReceiver<Command>,
    reader: FramedRead<tokio::io::ReadHalf<Box<dyn AsyncStream>>, LinesCodec>,
    writer: FramedWrite<tokio::io::WriteHalf<Box<dyn AsyncStream>>, LinesCodec>,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    sessions: HashMap<SessionId, SessionHandle>,
    workers: HashMap<String, SessionId>,
    open: Arc<AtomicBool>,
}

impl Connection {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(Command::Send { session, kind, id, method, params }) => {
                            if !self.forward(session, kind, id, method, params).await {
                                break;
                            }
                        }
                        Some(Command::Register(session)) => {
                            self.sessions.insert(session.id, session);
                        }
                        Some(Command::Unregister(session_id)) => {
                            self.sessions.remove(&session_id);
                            self.pending.retain(|_, pending| pending.session.id != session_id);
                            self.workers.retain(|_, id| *id != session_id);
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }

                line = self.reader.next() => {
                    match line {
                        Some(Ok(line)) => self.handle_line(&line),
                        Some(Err(err)) => {
                            warn!("connection {}: read failed: {err}", self.id);
                            break;
                        }
                        None => {
                            debug!("connection {}: closed by pool", self.id);
                            break;
                        }
                    }
                }
            }
        }

        self.close();
    }

    /// Writes are best-effort FIFO; a failed write kills the connection.
    async fn forward(
        &mut self,
        session: SessionHandle,
        kind: RequestKind,
        id: Id,
        method: String,
        params: Value,
    ) -> bool {
        let internal = self.next_id;
        self.next_id += 1;

        let frame = Message::Request {
            id: Id::Number(internal),
            method,
            params,
        };

        let frame = match serde_json::to_string(&frame) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("connection {}: failed to serialize request: {err}", self.id);
                session.deliver(Event::Response {
                    kind,
                    id,
                    result: None,
                    error: Some(json!({ "code": -1, "message": "malformed request" })),
                });
                return true;
            }
        };

        if let Err(err) = self.writer.send(frame).await {
            warn!("connection {}: write failed: {err}", self.id);
            session.deliver(Event::Response {
                kind,
                id,
                result: None,
                error: Some(json!({ "code": -1, "message": "connection closed" })),
            });
            return false;
        }

        self.pending.insert(internal, PendingRequest { session, kind, id });

        true
    }

    fn handle_line(&mut self, line: &str) {
        let message = match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(err) => {
                warn!("connection {}: dropping malformed line: {err}", self.id);
                return;
            }
        };

        match message {
            Message::Response { id, result, error } => {
                let internal = match id {
                    Id::Number(internal) => internal,
                    other => {
                        warn!("connection {}: response with non-numeric id {other}", self.id);
                        return;
                    }
                };

                let Some(PendingRequest { session, kind, id }) = self.pending.remove(&internal)
                else {
                    warn!("connection {}: unmatched response id={internal}", self.id);
                    return;
                };

                if kind == RequestKind::Login
                    && let Some(worker) = result
                        .as_ref()
                        .and_then(|result| result.get("id"))
                        .and_then(Value::as_str)
                {
                    self.workers.insert(worker.to_string(), session.id);
                }

                session.deliver(Event::Response {
                    kind,
                    id,
                    result,
                    error,
                });
            }
            Message::Notification { method, params } if method == "job" => {
                let job = match serde_json::from_value::<Job>(params) {
                    Ok(job) => job,
                    Err(err) => {
                        warn!("connection {}: dropping malformed job: {err}", self.id);
                        return;
                    }
                };

                let Some(worker) = job.id.as_deref() else {
                    warn!("connection {}: dropping job without worker id", self.id);
                    return;
                };

                let Some(session) = self
                    .workers
                    .get(worker)
                    .and_then(|id| self.sessions.get(id))
                else {
                    warn!(
                        "connection {}: dropping job for unknown worker {worker}",
                        self.id
                    );
                    return;
                };

                session.deliver(Event::Job(job));
            }
            Message::Notification { method, .. } => {
                warn!("connection {}: unhandled notification {method}", self.id);
            }
            Message::Request { method, .. } => {
                warn!("connection {}: unexpected request {method} from pool", self.id);
            }
        }
    }

    /// Fail every in-flight request, then tell every registered session the
    /// connection is gone. Sessions unregister themselves on the way down.
    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);

        for (_, PendingRequest { session, kind, id }) in std::mem::take(&mut self.pending) {
            session.deliver(Event::Response {
                kind,
                id,
                result: None,
                error: Some(json!({ "code": -1, "message": "connection closed" })),
            });
        }

        for session in self.sessions.values() {
            session.deliver(Event::Closed);
        }

        info!("connection {} closed", self.id);
    }
}

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

static TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth(),
    )
});

async fn dial(
    host: &str,
    port: u16,
    ssl: bool,
    timeout: Duration,
) -> Result<Box<dyn AsyncStream>, UpstreamError> {
    let stream = ResultExt::context(
        ResultExt::context(
            tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
            TimeoutSnafu,
        )?,
        IoSnafu,
    )?;

    let _ = stream.set_nodelay(true);

    if ssl {
        let connector = TlsConnector::from(TLS_CONFIG.clone());

        let name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| UpstreamError::ServerName { host: host.into() })?;

        let stream = ResultExt::context(connector.connect(name, stream).await, IoSnafu)?;

        Ok(Box::new(stream))
    } else {
        Ok(Box::new(stream))
    }
}
