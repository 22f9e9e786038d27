use super::*;

/// The downstream transport seam. Production hands in a WebSocket; tests
/// hand in a channel pair. `recv` returning `None` means the client is gone,
/// whatever the transport's reason.
pub(crate) trait Downstream: Send {
    fn send(&mut self, message: Message) -> impl Future<Output = Result> + Send;
    fn recv(&mut self) -> impl Future<Output = Option<String>> + Send;
}

/// One logical browser miner. Owns the downstream socket and the donation
/// sessions; holds a non-owning handle to its upstream connection.
pub(crate) struct Miner<D: Downstream> {
    id: SessionId,
    downstream: D,
    upstream: Upstream,
    handle: SessionHandle,
    rx: mpsc::UnboundedReceiver<Mail>,
    settings: Arc<Settings>,
    pass: String,
    client_login: Option<String>,
    worker_id: Option<String>,
    job: Option<Job>,
    active: Source,
    donations: Vec<Donation>,
    accepted: u64,
    rejected: u64,
    cancel: CancellationToken,
}

impl<D: Downstream> Miner<D> {
    pub(crate) fn new(
        id: SessionId,
        downstream: D,
        upstream: Upstream,
        pass: String,
        donations: Vec<(SessionId, DonationConfig, Upstream)>,
        settings: Arc<Settings>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = SessionHandle::new(id, Source::Host, tx.clone());

        let donations = donations
            .into_iter()
            .enumerate()
            .map(|(index, (id, config, upstream))| {
                Donation::new(id, index, config, upstream, tx.clone())
            })
            .collect();

        Self {
            id,
            downstream,
            upstream,
            handle,
            rx,
            settings,
            pass,
            client_login: None,
            worker_id: None,
            job: None,
            active: Source::Host,
            donations,
            accepted: 0,
            rejected: 0,
            cancel,
        }
    }

    pub(crate) async fn serve(&mut self) -> Result {
        let result = self.drive().await;

        self.upstream.unregister(&self.handle);
        for donation in &self.donations {
            donation.shutdown();
        }

        info!(
            "miner {} closed (accepted {}, rejected {})",
            self.id, self.accepted, self.rejected
        );

        result
    }

    async fn drive(&mut self) -> Result {
        self.upstream
            .register(&self.handle)
            .context("failed to register with upstream connection")?;

        for donation in &mut self.donations {
            donation.connect();
        }

        let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("miner {}: shutting down", self.id);
                    break;
                }

                message = self.downstream.recv() => {
                    let Some(text) = message else {
                        debug!("miner {}: client disconnected", self.id);
                        break;
                    };

                    self.handle_downstream(&text).await?;
                }

                mail = self.rx.recv() => {
                    let Some(mail) = mail else {
                        break;
                    };

                    if !self.handle_mail(mail).await? {
                        break;
                    }
                }

                _ = keepalive.tick() => self.keepalive(),
            }
        }

        Ok(())
    }

    async fn handle_downstream(&mut self, text: &str) -> Result {
        let message = match serde_json::from_str::<Message>(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("miner {}: dropping malformed message: {err}", self.id);
                return Ok(());
            }
        };

        let Message::Request { id, method, params } = message else {
            warn!("miner {}: ignoring non-request message", self.id);
            return Ok(());
        };

        match method.as_str() {
            "login" => self.login(id, params).await,
            "submit" => self.submit(id, params).await,
            "keepalived" => self.keepalived(id, params).await,
            method => {
                warn!("miner {}: unknown method {method}", self.id);
                Ok(())
            }
        }
    }

    /// Forward the login under the configured identity, keeping the pass the
    /// proxy was configured with rather than whatever the client sent.
    async fn login(&mut self, id: Id, params: Value) -> Result {
        let login = params
            .get("login")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let agent = params.get("agent").cloned().unwrap_or(Value::Null);

        let login_as = self
            .settings
            .login_override()
            .unwrap_or(&login)
            .to_string();

        self.client_login = Some(login);

        let forwarded = json!({ "login": login_as, "pass": self.pass, "agent": agent });

        if let Err(err) = self
            .upstream
            .send(&self.handle, RequestKind::Login, id.clone(), "login", forwarded)
        {
            warn!("miner {}: login failed: {err}", self.id);
            self.downstream.send(Message::error(id, "connection closed")).await?;
        }

        Ok(())
    }

    /// Attach the worker id of whichever session's job is current, so shares
    /// mined on a donation job land on the donation's connection.
    async fn submit(&mut self, id: Id, mut params: Value) -> Result {
        let worker = match self.active {
            Source::Host => self.worker_id.clone(),
            Source::Donation(index) => self.donations[index].worker_id.clone(),
        };

        let Some(worker) = worker else {
            warn!("miner {}: submit before login", self.id);
            self.downstream.send(Message::error(id, "unauthenticated")).await?;
            return Ok(());
        };

        let Some(object) = params.as_object_mut() else {
            warn!("miner {}: submit with non-object params", self.id);
            self.downstream.send(Message::error(id, "malformed submit")).await?;
            return Ok(());
        };

        debug!(
            "miner {}: share for job {} as {worker}",
            self.id,
            self.job
                .as_ref()
                .map(|job| job.job_id.as_str())
                .unwrap_or("<none>"),
        );

        object.insert("id".into(), json!(worker));

        let (upstream, handle) = match self.active {
            Source::Host => (&self.upstream, &self.handle),
            Source::Donation(index) => {
                let donation = &self.donations[index];
                (&donation.upstream, &donation.handle)
            }
        };

        if let Err(err) = upstream.send(handle, RequestKind::Submit, id.clone(), "submit", params) {
            warn!("miner {}: submit failed: {err}", self.id);
            self.downstream.send(Message::error(id, "connection closed")).await?;
        }

        Ok(())
    }

    async fn keepalived(&mut self, id: Id, mut params: Value) -> Result {
        if let Some(worker) = &self.worker_id
            && let Some(object) = params.as_object_mut()
        {
            object.insert("id".into(), json!(worker));
        }

        if let Err(err) =
            self.upstream
                .send(&self.handle, RequestKind::Keepalive, id.clone(), "keepalived", params)
        {
            warn!("miner {}: keepalive failed: {err}", self.id);
            self.downstream.send(Message::error(id, "connection closed")).await?;
        }

        Ok(())
    }

    /// Returns false when the session should end.
    async fn handle_mail(&mut self, mail: Mail) -> Result<bool> {
        match (mail.source, mail.event) {
            (Source::Host, Event::Response { kind: RequestKind::Login, id, result, error }) => {
                let result = self.login_response(result)?;
                self.downstream.send(Message::Response { id, result, error }).await?;
            }

            (Source::Donation(index), Event::Response { kind: RequestKind::Login, result, error, .. }) => {
                self.donations[index].login_result(result, error);
            }

            (_, Event::Response { kind: RequestKind::Submit, id, result, error }) => {
                if error.is_some() {
                    self.rejected += 1;
                    warn!("miner {}: share rejected", self.id);
                } else {
                    self.accepted += 1;
                }

                self.downstream.send(Message::Response { id, result, error }).await?;
            }

            // Proxy-initiated keepalives carry a null id and stop here.
            (_, Event::Response { kind: RequestKind::Keepalive, id: Id::Null, .. }) => {}

            (_, Event::Response { kind: RequestKind::Keepalive, id, result, error }) => {
                self.downstream.send(Message::Response { id, result, error }).await?;
            }

            (Source::Host, Event::Job(job)) => self.deliver_job(job).await?,

            (Source::Donation(index), Event::Job(job)) => {
                if self.active == Source::Donation(index) {
                    self.forward_job(job.clone()).await?;
                }
                self.donations[index].job = Some(job);
            }

            (Source::Host, Event::Closed) => {
                info!("miner {}: upstream connection closed", self.id);
                return Ok(false);
            }

            (Source::Donation(index), Event::Closed) => {
                warn!("miner {}: donation connection closed", self.id);
                self.donations[index].alive = false;
            }
        }

        Ok(true)
    }

    /// Record the worker id and initial job off a login response, rewriting
    /// the job target and the echoed identity before it goes back down.
    fn login_response(&mut self, mut result: Option<Value>) -> Result<Option<Value>> {
        let Some(result) = result.as_mut() else {
            return Ok(None);
        };

        if self.worker_id.is_none() {
            self.worker_id = result
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        if self.settings.login_override().is_some()
            && result.get("login").is_some()
            && let Some(login) = &self.client_login
        {
            result["login"] = json!(login);
        }

        if let Some(value) = result.get_mut("job") {
            match serde_json::from_value::<Job>(value.clone()) {
                Ok(mut job) => {
                    if let Some(diff) = self.settings.diff() {
                        job.retarget(diff);
                        *value = serde_json::to_value(&job)?;
                    }
                    self.job = Some(job);
                }
                Err(err) => warn!("miner {}: malformed job in login response: {err}", self.id),
            }
        }

        Ok(result.clone().into())
    }

    /// A fresh host job either goes straight down or yields its turn to the
    /// donation with the most outstanding debt.
    async fn deliver_job(&mut self, mut job: Job) -> Result {
        if let Some(index) = donation::take_turn(&mut self.donations, Instant::now()) {
            self.active = Source::Donation(index);

            if let Some(job) = self.donations[index].job.clone() {
                debug!("miner {}: donation {index} takes this job", self.id);
                return self.forward_job(job).await;
            }
        }

        self.active = Source::Host;

        if let Some(diff) = self.settings.diff() {
            job.retarget(diff);
        }

        self.forward_job(job).await
    }

    async fn forward_job(&mut self, job: Job) -> Result {
        self.downstream
            .send(Message::Notification {
                method: "job".into(),
                params: serde_json::to_value(&job)?,
            })
            .await?;

        self.job = Some(job);

        Ok(())
    }

    fn keepalive(&self) {
        if let Some(worker) = &self.worker_id {
            let _ = self.upstream.send(
                &self.handle,
                RequestKind::Keepalive,
                Id::Null,
                "keepalived",
                json!({ "id": worker }),
            );
        }

        for donation in &self.donations {
            donation.keepalive();
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            harness::{StubPool, TestClient, channel_downstream},
            upstream::Command,
        },
        pretty_assertions::assert_eq,
    };

    async fn start_miner(stub: &StubPool, settings: Settings) -> (TestClient, CancellationToken) {
        let upstream = Upstream::connect(
            0,
            "127.0.0.1",
            stub.address.port(),
            false,
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (downstream, client) = channel_downstream();
        let cancel = CancellationToken::new();

        let mut miner = Miner::new(
            0,
            downstream,
            upstream,
            "x".into(),
            Vec::new(),
            Arc::new(settings),
            cancel.clone(),
        );

        tokio::spawn(async move {
            let _ = miner.serve().await;
        });

        (client, cancel)
    }

    fn login_request() -> Value {
        json!({
            "id": 1,
            "method": "login",
            "params": { "login": "44client", "pass": "whatever", "agent": "browser/1.0" },
        })
    }

    async fn response(client: &mut TestClient) -> (Id, Option<Value>, Option<Value>) {
        match client.recv().await {
            Message::Response { id, result, error } => (id, result, error),
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn notification(client: &mut TestClient) -> (String, Value) {
        match client.recv().await {
            Message::Notification { method, params } => (method, params),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_round_trip_preserves_client_id() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send(login_request());

        let (_, request) = stub.request().await;
        assert_eq!(request["method"], json!("login"));
        assert_eq!(request["params"]["login"], json!("44client"));
        assert_eq!(request["params"]["pass"], json!("x"), "configured pass wins");
        assert_eq!(request["params"]["agent"], json!("browser/1.0"));

        let (id, result, error) = response(&mut client).await;
        assert_eq!(id, Id::Number(1));
        assert!(error.is_none());

        let result = result.unwrap();
        assert_eq!(result["id"], json!("w0"));
        assert_eq!(result["job"]["job_id"], json!("job-0-0"));
    }

    #[tokio::test]
    async fn difficulty_override_rewrites_targets() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) =
            start_miner(&stub, Settings::for_tests().with_diff(5000)).await;
        let target = Difficulty::from(5000).target_hex();

        client.send(login_request());
        stub.request().await;

        let (_, result, _) = response(&mut client).await;
        assert_eq!(result.unwrap()["job"]["target"], json!(target));

        stub.inject(
            0,
            json!({
                "method": "job",
                "params": { "job_id": "j2", "blob": "07", "target": "ffff0000", "id": "w0" },
            }),
        );

        let (method, params) = notification(&mut client).await;
        assert_eq!(method, "job");
        assert_eq!(params["job_id"], json!("j2"));
        assert_eq!(params["target"], json!(target));
    }

    #[tokio::test]
    async fn submit_attaches_server_issued_worker_id() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send(login_request());
        stub.request().await;
        response(&mut client).await;

        client.send(json!({
            "id": 2,
            "method": "submit",
            "params": { "id": "whatever-the-client-says", "job_id": "job-0-0", "nonce": "a0b1c2d3", "result": "00ff" },
        }));

        let (_, request) = stub.request().await;
        assert_eq!(request["method"], json!("submit"));
        assert_eq!(request["params"]["id"], json!("w0"));
        assert_eq!(request["params"]["job_id"], json!("job-0-0"));

        let (id, result, error) = response(&mut client).await;
        assert_eq!(id, Id::Number(2));
        assert!(error.is_none());
        assert_eq!(result.unwrap()["status"], json!("OK"));
    }

    #[tokio::test]
    async fn submit_before_login_fails_locally() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send(json!({
            "id": 1,
            "method": "submit",
            "params": { "job_id": "j1", "nonce": "00", "result": "00" },
        }));

        let (id, result, error) = response(&mut client).await;
        assert_eq!(id, Id::Number(1));
        assert!(result.is_none());
        assert_eq!(error.unwrap()["message"], json!("unauthenticated"));
        assert!(stub.try_request().is_none(), "nothing went upstream");
    }

    #[tokio::test]
    async fn identity_override_is_invisible_to_the_client() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) =
            start_miner(&stub, Settings::for_tests().with_address("44operator")).await;

        client.send(login_request());

        let (_, request) = stub.request().await;
        assert_eq!(request["params"]["login"], json!("44operator"));

        let (_, result, _) = response(&mut client).await;
        assert_eq!(
            result.unwrap()["login"],
            json!("44client"),
            "the client keeps seeing its own identity"
        );
    }

    #[tokio::test]
    async fn keepalived_is_relayed_with_the_client_id() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send(login_request());
        stub.request().await;
        response(&mut client).await;

        client.send(json!({ "id": 5, "method": "keepalived", "params": {} }));

        let (_, request) = stub.request().await;
        assert_eq!(request["method"], json!("keepalived"));
        assert_eq!(request["params"]["id"], json!("w0"));

        let (id, result, _) = response(&mut client).await;
        assert_eq!(id, Id::Number(5));
        assert_eq!(result.unwrap()["status"], json!("KEEPALIVED"));
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_not_fatal() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send_raw("this is not json");
        client.send_raw(r#"{"result":"responses from clients are ignored"}"#);

        client.send(login_request());
        let (_, request) = stub.request().await;
        assert_eq!(request["method"], json!("login"));

        let (id, _, _) = response(&mut client).await;
        assert_eq!(id, Id::Number(1));
    }

    #[tokio::test]
    async fn upstream_close_ends_the_session() {
        let mut stub = StubPool::spawn().await;
        let (mut client, _cancel) = start_miner(&stub, Settings::for_tests()).await;

        client.send(login_request());
        stub.request().await;
        response(&mut client).await;

        stub.close(0);

        assert!(client.next().await.is_none(), "miner hangs up downstream");
    }

    async fn next_register(commands: &mut mpsc::UnboundedReceiver<Command>) -> SessionHandle {
        loop {
            match commands.recv().await.expect("connection command channel closed") {
                Command::Register(session) => return session,
                _ => continue,
            }
        }
    }

    async fn next_request(
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> (SessionHandle, RequestKind, Id, Value) {
        loop {
            match commands.recv().await.expect("connection command channel closed") {
                Command::Send {
                    session,
                    kind,
                    id,
                    params,
                    ..
                } if kind != RequestKind::Keepalive => return (session, kind, id, params),
                _ => continue,
            }
        }
    }

    fn job(values: Value) -> Job {
        serde_json::from_value(values).unwrap()
    }

    #[tokio::test]
    async fn client_disconnect_unregisters_everywhere() {
        let (host_upstream, mut host_commands) = Upstream::stub(0, false);
        let (donation_upstream, mut donation_commands) = Upstream::stub(1, true);

        let (downstream, mut client) = channel_downstream();

        let config = "44donate@donate.example.com:3333:x:0.25"
            .parse::<DonationConfig>()
            .unwrap();

        let mut miner = Miner::new(
            0,
            downstream,
            host_upstream.clone(),
            "x".into(),
            vec![(1, config, donation_upstream.clone())],
            Arc::new(Settings::for_tests()),
            CancellationToken::new(),
        );

        let served = tokio::spawn(async move {
            let _ = miner.serve().await;
        });

        next_register(&mut host_commands).await;
        next_register(&mut donation_commands).await;
        assert_eq!(host_upstream.miners(), 1);
        assert_eq!(donation_upstream.donations(), 1);

        client.hang_up();
        served.await.unwrap();

        assert!(host_upstream.is_empty());
        assert!(donation_upstream.is_empty());

        let unregistered = loop {
            match host_commands.try_recv() {
                Ok(Command::Unregister(id)) => break id,
                Ok(_) => continue,
                Err(_) => panic!("no unregister command"),
            }
        };
        assert_eq!(unregistered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn donation_takes_a_turn_and_receives_its_submits() {
        let (host_upstream, mut host_commands) = Upstream::stub(0, false);
        let (donation_upstream, mut donation_commands) = Upstream::stub(1, true);

        let (downstream, mut client) = channel_downstream();
        let cancel = CancellationToken::new();

        let config = "44donate@donate.example.com:3333:x:0.25"
            .parse::<DonationConfig>()
            .unwrap();

        let mut miner = Miner::new(
            0,
            downstream,
            host_upstream,
            "x".into(),
            vec![(1, config, donation_upstream)],
            Arc::new(Settings::for_tests().with_diff(5000)),
            cancel.clone(),
        );

        tokio::spawn(async move {
            let _ = miner.serve().await;
        });

        let host_session = next_register(&mut host_commands).await;
        let donation_session = next_register(&mut donation_commands).await;

        // The donation logs itself in as soon as the miner comes up.
        let (_, kind, id, params) = next_request(&mut donation_commands).await;
        assert_eq!(kind, RequestKind::Login);
        assert_eq!(id, Id::Null);
        assert_eq!(params["login"], json!("44donate"));

        donation_session.deliver(Event::Response {
            kind: RequestKind::Login,
            id: Id::Null,
            result: Some(json!({
                "id": "dw0",
                "job": { "job_id": "dj0", "blob": "06", "target": "eeee0000" },
            })),
            error: None,
        });

        client.send(json!({
            "id": 1,
            "method": "login",
            "params": { "login": "44client", "pass": "x" },
        }));

        let (_, kind, id, _) = next_request(&mut host_commands).await;
        assert_eq!(kind, RequestKind::Login);

        host_session.deliver(Event::Response {
            kind: RequestKind::Login,
            id,
            result: Some(json!({
                "id": "w0",
                "job": { "job_id": "hj0", "blob": "06", "target": "ffff0000" },
            })),
            error: None,
        });

        match client.recv().await {
            Message::Response { result, .. } => {
                assert_eq!(result.unwrap()["id"], json!("w0"));
            }
            other => panic!("expected login response, got {other:?}"),
        }

        // A quarter of four job-lengths of elapsed time is one whole job of
        // debt, so the next job turn belongs to the donation.
        tokio::time::advance(4 * JOB_TIME).await;

        host_session.deliver(Event::Job(job(json!({
            "job_id": "hj1", "blob": "06", "target": "ffff0000",
        }))));

        match client.recv().await {
            Message::Notification { params, .. } => {
                assert_eq!(params["job_id"], json!("dj0"));
                assert_eq!(params["target"], json!("eeee0000"), "donation keeps its own target");
            }
            other => panic!("expected donation job, got {other:?}"),
        }

        // A share mined against the donation job rides the donation's
        // connection under the donation's worker id.
        client.send(json!({
            "id": 2,
            "method": "submit",
            "params": { "id": "w0", "job_id": "dj0", "nonce": "00", "result": "00" },
        }));

        let (_, kind, id, params) = next_request(&mut donation_commands).await;
        assert_eq!(kind, RequestKind::Submit);
        assert_eq!(id, Id::Number(2));
        assert_eq!(params["id"], json!("dw0"));

        donation_session.deliver(Event::Response {
            kind: RequestKind::Submit,
            id,
            result: Some(json!({ "status": "OK" })),
            error: None,
        });

        let (id, result, _) = response(&mut client).await;
        assert_eq!(id, Id::Number(2));
        assert_eq!(result.unwrap()["status"], json!("OK"));

        // The debt is settled; the next job is the host's again, retargeted.
        host_session.deliver(Event::Job(job(json!({
            "job_id": "hj2", "blob": "06", "target": "ffff0000",
        }))));

        match client.recv().await {
            Message::Notification { params, .. } => {
                assert_eq!(params["job_id"], json!("hj2"));
                assert_eq!(params["target"], json!(Difficulty::from(5000).target_hex()));
            }
            other => panic!("expected host job, got {other:?}"),
        }

        // No submit ever reached the host connection.
        while let Ok(command) = host_commands.try_recv() {
            if let Command::Send { kind, .. } = command {
                assert_ne!(kind, RequestKind::Submit);
            }
        }
    }
}
