use super::*;

/// A scripted stand-in for a Stratum pool: accepts TCP connections, records
/// every request it reads, optionally auto-answers the three methods the
/// proxy speaks, and lets tests inject arbitrary lines or hang up.
pub(crate) struct StubPool {
    pub(crate) address: SocketAddr,
    requests: mpsc::UnboundedReceiver<(usize, Value)>,
    connections: Arc<parking_lot::Mutex<Vec<Option<mpsc::UnboundedSender<String>>>>>,
}

impl StubPool {
    pub(crate) async fn spawn() -> StubPool {
        Self::spawn_inner(true).await
    }

    /// Never answers anything by itself; tests drive every line.
    pub(crate) async fn spawn_silent() -> StubPool {
        Self::spawn_inner(false).await
    }

    async fn spawn_inner(auto: bool) -> StubPool {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let (request_tx, requests) = mpsc::unbounded_channel();
        let connections = Arc::new(parking_lot::Mutex::new(Vec::new()));

        tokio::spawn({
            let connections = connections.clone();

            async move {
                for conn in 0.. {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };

                    let (inject_tx, inject_rx) = mpsc::unbounded_channel();
                    connections.lock().push(Some(inject_tx));

                    tokio::spawn(serve_connection(
                        stream,
                        conn,
                        auto,
                        request_tx.clone(),
                        inject_rx,
                    ));
                }
            }
        });

        StubPool {
            address,
            requests,
            connections,
        }
    }

    /// The next request read from any connection, as `(connection, json)`.
    pub(crate) async fn request(&mut self) -> (usize, Value) {
        self.requests.recv().await.expect("stub pool stopped")
    }

    pub(crate) fn try_request(&mut self) -> Option<(usize, Value)> {
        self.requests.try_recv().ok()
    }

    pub(crate) fn inject(&self, conn: usize, value: Value) {
        self.inject_raw(conn, value.to_string());
    }

    pub(crate) fn inject_raw(&self, conn: usize, line: String) {
        self.connections.lock()[conn]
            .as_ref()
            .expect("connection already closed")
            .send(line)
            .unwrap();
    }

    /// Hang up on one connection.
    pub(crate) fn close(&self, conn: usize) {
        self.connections.lock()[conn] = None;
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn: usize,
    auto: bool,
    request_tx: mpsc::UnboundedSender<(usize, Value)>,
    mut inject_rx: mpsc::UnboundedReceiver<String>,
) {
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, LinesCodec::new());
    let mut writer = FramedWrite::new(writer, LinesCodec::new());

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(Ok(line)) = line else {
                    break;
                };

                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };

                let reply = if auto { respond(conn, &value) } else { None };

                let _ = request_tx.send((conn, value));

                if let Some(reply) = reply
                    && writer.send(reply.to_string()).await.is_err()
                {
                    break;
                }
            }

            line = inject_rx.recv() => {
                let Some(line) = line else {
                    break;
                };

                if writer.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn respond(conn: usize, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match request.get("method").and_then(Value::as_str) {
        Some("login") => {
            let login = request
                .pointer("/params/login")
                .cloned()
                .unwrap_or(Value::Null);

            Some(json!({
                "id": id,
                "result": {
                    "id": format!("w{conn}"),
                    "job": raw_job(conn),
                    "status": "OK",
                    "login": login,
                },
                "error": null,
            }))
        }
        Some("submit") => Some(json!({
            "id": id,
            "result": { "status": "OK" },
            "error": null,
        })),
        Some("keepalived") => Some(json!({
            "id": id,
            "result": { "status": "KEEPALIVED" },
            "error": null,
        })),
        _ => None,
    }
}

fn raw_job(conn: usize) -> Value {
    json!({
        "job_id": format!("job-{conn}-0"),
        "blob": "0606f0ffee",
        "target": "ffff0000",
        "id": format!("w{conn}"),
        "algo": "rx/0",
    })
}

/// The test side of a channel-backed [`Downstream`].
pub(crate) struct TestClient {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl TestClient {
    pub(crate) fn send(&self, value: Value) {
        self.tx.send(value.to_string()).unwrap();
    }

    pub(crate) fn send_raw(&self, text: &str) {
        self.tx.send(text.into()).unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Message {
        self.rx.recv().await.expect("miner hung up")
    }

    /// Like [`recv`](Self::recv), but `None` when the miner is gone.
    pub(crate) async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub(crate) fn hang_up(&mut self) {
        self.tx = mpsc::unbounded_channel().0;
    }
}

pub(crate) struct ChannelDownstream {
    rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<Message>,
}

pub(crate) fn channel_downstream() -> (ChannelDownstream, TestClient) {
    let (client_tx, downstream_rx) = mpsc::unbounded_channel();
    let (downstream_tx, client_rx) = mpsc::unbounded_channel();

    (
        ChannelDownstream {
            rx: downstream_rx,
            tx: downstream_tx,
        },
        TestClient {
            tx: client_tx,
            rx: client_rx,
        },
    )
}

impl Downstream for ChannelDownstream {
    async fn send(&mut self, message: Message) -> Result {
        self.tx.send(message).map_err(|_| Error::msg("client gone"))
    }

    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}
