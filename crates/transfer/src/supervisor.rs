//! Transfer supervisor: wires the balancer, relay, UDP pair and health
//! scans together and owns their lifecycle.

use crate::events::{EventSender, TransferEvent};
use crate::options::{Heartbeat, TransferOptions};
use crate::relay::TcpRelay;
use crate::udp::{
    ForwardHandle, ForwardOptions, LoopbackForwarder, UdpForwarder, UPSTREAM_ADDRESS,
    UPSTREAM_PORT,
};
use balance::{Balancer, Target};
use common::{Error, Result};
use shadowcheck::{HandshakeChecker, Socks5Checker};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// How long `unlisten` waits for teardown before giving up.
const UNLISTEN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of the supervisor. Re-entering `Listening` after a close
/// requires constructing a new supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Listening,
    Closed,
}

/// Everything a health scan needs, detached from `&self` so the timer task
/// can own a copy.
#[derive(Clone)]
struct ScanContext {
    balancer: Arc<Balancer>,
    checker: Arc<dyn HandshakeChecker>,
    events: EventSender,
    probe_host: IpAddr,
    scan_lock: Arc<tokio::sync::Mutex<()>>,
}

struct SpeedSample {
    at: Instant,
    bytes: u64,
}

/// The Socket Transfer supervisor.
///
/// Construction binds the UDP forwarder pair and starts the heartbeat
/// timer; `listen` brings up the TCP relay. Dropping the supervisor stops
/// the timer, aborts the relay and ends both UDP sockets.
pub struct SocketTransfer {
    address: IpAddr,
    port: u16,
    balancer: Arc<Balancer>,
    relay: TcpRelay,
    udp: Vec<ForwardHandle>,
    heartbeat: Mutex<Vec<u64>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    scan: ScanContext,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    bytes: Arc<AtomicU64>,
    speed: Mutex<SpeedSample>,
    state: State,
}

impl SocketTransfer {
    /// Build a supervisor probing targets with the default SOCKS5 checker.
    pub async fn new(options: TransferOptions) -> Result<Self> {
        Self::with_checker(options, Arc::new(Socks5Checker::default())).await
    }

    /// Build a supervisor with an explicit handshake checker.
    pub async fn with_checker(
        options: TransferOptions,
        checker: Arc<dyn HandshakeChecker>,
    ) -> Result<Self> {
        options.validate()?;

        let balancer = Arc::new(Balancer::new(options.strategy, options.targets.clone()));
        let bytes = Arc::new(AtomicU64::new(0));
        let (events, events_rx) = EventSender::channel();
        let relay = TcpRelay::new(
            options.bind,
            Arc::clone(&balancer),
            events.clone(),
            Arc::clone(&bytes),
        );

        let upstream: IpAddr = UPSTREAM_ADDRESS.parse().map_err(Error::config)?;
        let forwarder = LoopbackForwarder;
        let udp = vec![
            forwarder
                .create(
                    UPSTREAM_PORT,
                    upstream,
                    ForwardOptions::new(SocketAddr::new(
                        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                        options.port,
                    )),
                )
                .await?,
            forwarder
                .create(
                    UPSTREAM_PORT,
                    upstream,
                    ForwardOptions::new(SocketAddr::new(
                        IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
                        options.port,
                    )),
                )
                .await?,
        ];

        let supervisor = Self {
            address: options.address,
            port: options.port,
            balancer: Arc::clone(&balancer),
            relay,
            udp,
            heartbeat: Mutex::new(options.heartbeat.schedule()),
            timer: Mutex::new(None),
            scan: ScanContext {
                balancer,
                checker,
                events,
                probe_host: options.bind,
                scan_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
            events_rx: Some(events_rx),
            bytes,
            speed: Mutex::new(SpeedSample {
                at: Instant::now(),
                bytes: 0,
            }),
            state: State::Initialized,
        };
        supervisor.schedule_health_check();
        Ok(supervisor)
    }

    /// Take the event receiver. Available exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Bind the TCP relay, returning the bound port.
    pub async fn listen(&mut self, port: Option<u16>) -> Result<u16> {
        if self.state != State::Initialized {
            return Err(Error::state(format!(
                "listen() is not valid in state {:?}",
                self.state
            )));
        }
        let port = port.unwrap_or(self.port);
        let bound = self.relay.listen(self.address, port).await?;
        self.port = bound;
        self.state = State::Listening;
        Ok(bound)
    }

    /// Close the listener and end both UDP sockets.
    ///
    /// Bounded by a 500 ms deadline after which `UnlistenTimeout` is
    /// returned; in-flight sessions are never torn down here.
    pub async fn unlisten(&mut self) -> Result<()> {
        self.state = State::Closed;
        let result = timeout(UNLISTEN_TIMEOUT, self.relay.close()).await;
        for handle in &self.udp {
            handle.end();
        }
        match result {
            Ok(()) => {
                info!("socket transfer closed");
                Ok(())
            }
            Err(_) => {
                warn!("unlisten timed out");
                Err(Error::UnlistenTimeout)
            }
        }
    }

    /// Cancel the heartbeat timer and close everything down.
    pub async fn stop(&mut self) {
        self.stop_health_check();
        if let Err(e) = self.unlisten().await {
            warn!(error = %e, "unlisten during stop");
        }
    }

    /// Cancel the heartbeat timer. Scans in flight finish on their own.
    pub fn stop_health_check(&self) {
        if let Some(task) = self.timer.lock().expect("timer lock poisoned").take() {
            task.abort();
        }
    }

    /// Replace the heartbeat cadence.
    ///
    /// Every entry must be a number no less than 5; on rejection the running
    /// timer is left untouched.
    pub fn set_heart_beat(&self, heartbeat: Heartbeat) -> Result<()> {
        heartbeat.validate()?;
        *self.heartbeat.lock().expect("heartbeat lock poisoned") = heartbeat.schedule();
        self.stop_health_check();
        self.schedule_health_check();
        Ok(())
    }

    /// Spawn the timer task for the current schedule: the prefix runs as
    /// one-shot delays, the last entry repeats as a periodic interval.
    fn schedule_health_check(&self) {
        let mut schedule = self
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .clone();
        let ctx = self.scan.clone();
        let task = tokio::spawn(async move {
            while schedule.len() > 1 {
                sleep(Duration::from_millis(schedule.remove(0))).await;
                Self::run_health_check(&ctx).await;
            }
            let mut ticker = interval(Duration::from_millis(schedule[0]));
            ticker.tick().await; // the first interval tick fires immediately
            loop {
                ticker.tick().await;
                Self::run_health_check(&ctx).await;
            }
        });
        *self.timer.lock().expect("timer lock poisoned") = Some(task);
    }

    /// One scan: probe every target, retry the failures once, prune and
    /// report only the targets that failed both passes.
    async fn run_health_check(ctx: &ScanContext) {
        let Ok(_guard) = ctx.scan_lock.try_lock() else {
            debug!("health scan still running, tick dropped");
            return;
        };

        let targets = ctx.balancer.targets();
        if targets.is_empty() {
            return;
        }
        debug!(targets = targets.len(), "health scan started");

        let suspects = match Self::probe_pass(ctx, &targets).await {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "health scan aborted");
                ctx.events.emit(TransferEvent::HealthCheckError {
                    error: e.to_string(),
                });
                return;
            }
        };
        if suspects.is_empty() {
            return;
        }

        // Second pass over the failures only, to suppress transient flaps.
        let confirmed = match Self::probe_pass(ctx, &suspects).await {
            Ok(failed) => failed,
            Err(e) => {
                warn!(error = %e, "health scan aborted on retry pass");
                ctx.events.emit(TransferEvent::HealthCheckError {
                    error: e.to_string(),
                });
                return;
            }
        };
        if confirmed.is_empty() {
            return;
        }

        warn!(failed = confirmed.len(), "targets failed both health passes");
        let failed_ids: HashSet<u16> = confirmed.iter().map(|t| t.id).collect();
        ctx.balancer.retain(|t| !failed_ids.contains(&t.id));
        ctx.events
            .emit(TransferEvent::HealthCheckFailed { targets: confirmed });
    }

    /// Probe the given targets concurrently; return the ones that failed.
    async fn probe_pass(ctx: &ScanContext, targets: &[Target]) -> Result<Vec<Target>> {
        let probes = targets.iter().map(|target| {
            let checker = Arc::clone(&ctx.checker);
            let host = ctx.probe_host;
            let target = *target;
            async move { (target, checker.check(host, target.id).await) }
        });

        let mut failed = Vec::new();
        for (target, verdict) in futures::future::join_all(probes).await {
            match verdict {
                Ok(true) => {}
                Ok(false) => failed.push(target),
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    /// Append targets to the registry.
    pub fn push_targets(&self, targets: Vec<Target>) {
        self.balancer.push_targets(targets);
    }

    /// Replace the registry and reseat balancer state.
    pub fn set_targets(&self, targets: Vec<Target>) {
        self.balancer.set_targets(targets);
    }

    /// Retain only targets satisfying the predicate.
    pub fn set_targets_with_filter<F>(&self, pred: F)
    where
        F: FnMut(&Target) -> bool,
    {
        self.balancer.retain(pred);
    }

    /// Copy of the current registry.
    pub fn get_targets(&self) -> Vec<Target> {
        self.balancer.targets()
    }

    /// Pin a target id for the SPECIFY strategy.
    pub fn specify_target(&self, id: u16) {
        self.balancer.specify(id);
    }

    /// Total bytes moved by completed relay sessions.
    pub fn bytes_transfer(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Transfer rate since the previous `speed` sample.
    pub fn speed(&self) -> String {
        let mut sample = self.speed.lock().expect("speed lock poisoned");
        let now = Instant::now();
        let bytes = self.bytes.load(Ordering::Relaxed);
        let elapsed = now.duration_since(sample.at).as_secs_f64();
        let delta = bytes.saturating_sub(sample.bytes);
        sample.at = now;
        sample.bytes = bytes;

        if elapsed <= f64::EPSILON {
            return "0 B/s".to_string();
        }
        format_rate(delta as f64 / elapsed)
    }
}

impl Drop for SocketTransfer {
    fn drop(&mut self) {
        self.stop_health_check();
        self.relay.abort();
        for handle in &self.udp {
            handle.end();
        }
    }
}

fn format_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_048_576.0 {
        format!("{:.1} MB/s", bytes_per_sec / 1_048_576.0)
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}
