use super::*;

#[derive(Debug, Clone, PartialEq)]
pub struct DonationConfig {
    pub address: String,
    pub host: String,
    pub port: u16,
    pub pass: String,
    pub percentage: f64,
}

/// `address@host:port:pass:percentage`, pass may be empty.
impl FromStr for DonationConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((address, rest)) = s.split_once('@') else {
            bail!("donation `{s}` is missing `@`");
        };

        ensure!(!address.is_empty(), "donation `{s}` has an empty address");

        let parts = rest.split(':').collect::<Vec<&str>>();

        ensure!(
            parts.len() == 4,
            "donation `{s}` must be address@host:port:pass:percentage"
        );

        ensure!(!parts[0].is_empty(), "donation `{s}` has an empty host");

        let port = parts[1]
            .parse::<u16>()
            .with_context(|| format!("donation `{s}` has an invalid port"))?;

        let percentage = parts[3]
            .parse::<f64>()
            .with_context(|| format!("donation `{s}` has an invalid percentage"))?;

        ensure!(
            percentage > 0.0 && percentage <= 1.0,
            "donation percentage must be in (0, 1], got {percentage}"
        );

        Ok(DonationConfig {
            address: address.into(),
            host: parts[0].into(),
            port,
            pass: if parts[2].is_empty() {
                "x".into()
            } else {
                parts[2].into()
            },
            percentage,
        })
    }
}

/// A virtual miner bound to its own upstream connection. It has no socket of
/// its own; the host miner yields job turns to it and routes the submits
/// that arrive while its job is the current one.
pub(crate) struct Donation {
    pub(crate) config: DonationConfig,
    pub(crate) upstream: Upstream,
    pub(crate) handle: SessionHandle,
    pub(crate) worker_id: Option<String>,
    pub(crate) job: Option<Job>,
    pub(crate) alive: bool,
    debt: Duration,
    accrued_at: Instant,
}

impl Donation {
    pub(crate) fn new(
        id: SessionId,
        index: usize,
        config: DonationConfig,
        upstream: Upstream,
        tx: mpsc::UnboundedSender<Mail>,
    ) -> Self {
        Self {
            config,
            upstream,
            handle: SessionHandle::new(id, Source::Donation(index), tx),
            worker_id: None,
            job: None,
            alive: true,
            debt: Duration::ZERO,
            accrued_at: Instant::now(),
        }
    }

    /// Register with the upstream connection and log in under the donation
    /// address. Failure kills the donation, never the host miner.
    pub(crate) fn connect(&mut self) {
        let connected = self
            .upstream
            .register(&self.handle)
            .and_then(|()| self.login());

        if let Err(err) = connected {
            warn!("donation to {} failed to connect: {err}", self.upstream.key());
            self.alive = false;
        }
    }

    fn login(&self) -> Result<(), upstream::UpstreamError> {
        self.upstream.send(
            &self.handle,
            RequestKind::Login,
            Id::Null,
            "login",
            json!({
                "login": self.config.address,
                "pass": self.config.pass,
                "agent": USER_AGENT,
            }),
        )
    }

    pub(crate) fn login_result(&mut self, result: Option<Value>, error: Option<Value>) {
        if let Some(error) = error {
            warn!("donation login to {} rejected: {error}", self.upstream.key());
            self.alive = false;
            return;
        }

        let Some(result) = result else {
            warn!("donation login to {} returned nothing", self.upstream.key());
            self.alive = false;
            return;
        };

        if self.worker_id.is_none() {
            self.worker_id = result
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        if let Some(value) = result.get("job") {
            match serde_json::from_value::<Job>(value.clone()) {
                Ok(job) => self.job = Some(job),
                Err(err) => warn!("donation job from {} malformed: {err}", self.upstream.key()),
            }
        }
    }

    pub(crate) fn keepalive(&self) {
        if !self.alive {
            return;
        }

        if let Some(worker) = &self.worker_id {
            let _ = self.upstream.send(
                &self.handle,
                RequestKind::Keepalive,
                Id::Null,
                "keepalived",
                json!({ "id": worker }),
            );
        }
    }

    pub(crate) fn shutdown(&self) {
        self.upstream.unregister(&self.handle);
    }

    fn accrue(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.accrued_at);
        self.debt += elapsed.mul_f64(self.config.percentage);
        self.accrued_at = now;
    }

    fn ready(&self) -> bool {
        self.alive && self.worker_id.is_some() && self.job.is_some()
    }

    #[cfg(test)]
    pub(crate) fn debt(&self) -> Duration {
        self.debt
    }
}

/// Accrue donated time on every live donation, then hand the turn to the one
/// with the largest debt worth at least one job, settling a job's worth of
/// debt against it. Ties go to the earliest donation.
pub(crate) fn take_turn(donations: &mut [Donation], now: Instant) -> Option<usize> {
    for donation in donations.iter_mut() {
        if donation.alive {
            donation.accrue(now);
        }
    }

    let mut winner: Option<usize> = None;

    for (index, donation) in donations.iter().enumerate() {
        if !donation.ready() || donation.debt < JOB_TIME {
            continue;
        }

        match winner {
            Some(current) if donations[current].debt >= donation.debt => {}
            _ => winner = Some(index),
        }
    }

    if let Some(index) = winner {
        donations[index].debt -= JOB_TIME;
    }

    winner
}
