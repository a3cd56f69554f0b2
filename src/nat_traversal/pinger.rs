/**
 * nat_traversal/pinger.rs
 *
 * UDP hole punching with TTL ramped marker datagrams.
 *
 * The provider runs a serve loop that punches towards every consumer
 * handed in through `ping_target` and gives the live socket to the NAT
 * proxy. The consumer punches once towards the provider with
 * `ping_provider` and keeps the socket.
 */

use super::event::{Event, NatEventWaiter, Publisher, EVENT_TOPIC};
use super::proxy::NatProxy;
use super::reusable_udp_socket;
use super::types::{ConfigParser, Params, ServiceType};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Stage name used in published events
pub const STAGE_NAME: &str = "hole_punching";

pub const PING_INTERVAL: Duration = Duration::from_millis(200);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

const TARGET_SEND_TIMEOUT: Duration = Duration::from_millis(100);
const PROVIDER_SETUP_DELAY: Duration = Duration::from_millis(400);
const KEEP_ALIVE_INTERVALS: u32 = 2;
const READ_BUFFER: usize = 512;

const RAMP_ATTEMPTS: u32 = 4;
const OPEN_TTL: u32 = 128;

#[derive(Debug, Error)]
pub enum PunchError {
    #[error("NAT punch attempt timed out")]
    TimedOut,

    #[error("NAT punch attempt stopped")]
    Stopped,

    #[error("NAT proxy is not available for service type {0}")]
    NoProxy(ServiceType),

    #[error("unable to parse ping config: {0}")]
    Config(String),

    #[error("failed to get connection: {0}")]
    Connection(#[source] io::Error),

    #[error("pinger setting ttl failed: {0}")]
    Ttl(#[source] io::Error),

    #[error("pinging request failed: {0}")]
    Io(#[from] io::Error),
}

/// TTL of the `n`th ping (1-based) within one attempt.
///
/// The first pings only travel a few hops so they open our own NAT
/// mapping without reaching the peer's router; after that every ping
/// goes all the way.
pub fn ttl_for_attempt(n: u32) -> u32 {
    if n > RAMP_ATTEMPTS {
        OPEN_TTL
    } else {
        n
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerState {
    Idle,
    WaitingPreviousStage,
    Serving,
    /// Previous stage succeeded, punching is not needed
    Skipped,
    Stopped,
}

pub struct Pinger {
    targets: mpsc::Sender<Params>,
    inbox: Mutex<Option<mpsc::Receiver<Params>>>,
    stop: CancellationToken,
    event_waiter: Arc<dyn NatEventWaiter>,
    config_parser: Arc<dyn ConfigParser>,
    nat_proxy: Arc<dyn NatProxy>,
    publisher: Arc<dyn Publisher>,
    previous_stage: String,
    consumer_port: AtomicU16,
    ping_timeout: Duration,
    state: watch::Sender<PingerState>,
}

impl Pinger {
    pub fn new(
        event_waiter: Arc<dyn NatEventWaiter>,
        config_parser: Arc<dyn ConfigParser>,
        nat_proxy: Arc<dyn NatProxy>,
        previous_stage: &str,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (targets, inbox) = mpsc::channel(1);
        let (state, _) = watch::channel(PingerState::Idle);
        Self {
            targets,
            inbox: Mutex::new(Some(inbox)),
            stop: CancellationToken::new(),
            event_waiter,
            config_parser,
            nat_proxy,
            publisher,
            previous_stage: previous_stage.to_string(),
            consumer_port: AtomicU16::new(0),
            ping_timeout: PING_TIMEOUT,
            state,
        }
    }

    /// How long an attempt waits for the first datagram from the peer
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn state(&self) -> PingerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PingerState> {
        self.state.subscribe()
    }

    /// Wait for the previous stage, then punch for every ping target
    /// until stopped. Attempt failures never end the loop.
    pub async fn start(&self) {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut inbox) = inbox else {
            warn!("NAT pinger already started");
            return;
        };

        info!("starting a NAT pinger");
        self.state.send_replace(PingerState::WaitingPreviousStage);

        tokio::select! {
            _ = self.stop.cancelled() => {
                self.state.send_replace(PingerState::Stopped);
                return;
            }
            succeeded = self.wait_for_previous_stage() => {
                if succeeded {
                    info!(stage = %self.previous_stage, "previous stage succeeded, no punching needed");
                    self.state.send_replace(PingerState::Skipped);
                    return;
                }
            }
        }

        self.state.send_replace(PingerState::Serving);
        loop {
            let params = tokio::select! {
                _ = self.stop.cancelled() => break,
                params = inbox.recv() => match params {
                    Some(params) => params,
                    None => break,
                },
            };
            if let Err(e) = self.accept(params) {
                warn!("ping attempt dropped: {}", e);
            }
        }

        info!("NAT pinger stopped");
        self.state.send_replace(PingerState::Stopped);
    }

    /// Safe to call any number of times, before or during `start`
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Hand a consumer to the serve loop; dropped if the loop does not
    /// take it within 100ms
    pub async fn ping_target(&self, params: Params) {
        if let Err(e) = self.targets.send_timeout(params, TARGET_SEND_TIMEOUT).await {
            debug!("ping target dropped: {}", e);
        }
    }

    /// Punch towards the provider from the bound consumer port. The
    /// returned socket is connected to the provider.
    pub async fn ping_provider(
        &self,
        ip: &str,
        port: u16,
        stop: &CancellationToken,
    ) -> Result<UdpSocket, PunchError> {
        info!("NAT pinging to provider");

        let local_port = self.consumer_port.load(Ordering::SeqCst);
        let socket = get_connection(ip, port, local_port)?;
        let done = CancellationToken::new();

        let pinging = ping(&socket, self.publisher.as_ref(), &done);
        let receiving = async {
            tokio::time::sleep(PING_INTERVAL).await;
            let received = receive(&socket, self.ping_timeout, stop, &self.stop).await;
            done.cancel();
            received
        };
        let (pinged, received) = tokio::join!(pinging, receiving);
        if let Err(e) = pinged {
            warn!("error while pinging: {}", e);
        }
        received?;

        // Give the provider time to hand its socket to the proxy
        tokio::time::sleep(PROVIDER_SETUP_DELAY).await;
        Ok(socket)
    }

    pub fn bind_consumer_port(&self, port: u16) {
        self.consumer_port.store(port, Ordering::SeqCst);
    }

    pub fn bind_service_port(&self, service_type: ServiceType, port: u16) {
        self.nat_proxy.register_service_port(service_type, port);
    }

    async fn wait_for_previous_stage(&self) -> bool {
        while let Some(event) = self.event_waiter.wait_for_event().await {
            if event.stage == self.previous_stage {
                return event.successful;
            }
        }
        false
    }

    fn accept(&self, params: Params) -> Result<(), PunchError> {
        let config = self
            .config_parser
            .parse(&params.request_config)
            .map_err(|e| PunchError::Config(e.to_string()))?;
        info!(ip = %config.ip, port = config.port, "ping target received");

        if !self.nat_proxy.is_available(&config.service_type) {
            return Err(PunchError::NoProxy(config.service_type));
        }

        let socket = get_connection(&config.ip, config.port, params.port)?;
        let attempt = Attempt {
            socket,
            service_type: config.service_type,
            cancel: params.cancel,
            stop: self.stop.clone(),
            timeout: self.ping_timeout,
            nat_proxy: self.nat_proxy.clone(),
            publisher: self.publisher.clone(),
        };
        tokio::spawn(attempt.run());
        Ok(())
    }
}

/// One provider side punch towards a single consumer
struct Attempt {
    socket: UdpSocket,
    service_type: ServiceType,
    cancel: CancellationToken,
    stop: CancellationToken,
    timeout: Duration,
    nat_proxy: Arc<dyn NatProxy>,
    publisher: Arc<dyn Publisher>,
}

impl Attempt {
    async fn run(self) {
        let done = CancellationToken::new();
        let pinging = ping(&self.socket, self.publisher.as_ref(), &done);
        let receiving = async {
            let received = receive(&self.socket, self.timeout, &self.cancel, &self.stop).await;
            done.cancel();
            received
        };
        let (pinged, received) = tokio::join!(pinging, receiving);
        if let Err(e) = pinged {
            warn!("error while pinging: {}", e);
        }
        if let Err(e) = received {
            warn!("ping receiver error: {}", e);
            return;
        }

        info!(service_type = %self.service_type, "ping received, handing off connection");
        self.nat_proxy.hand_off(&self.service_type, self.socket);
    }
}

fn get_connection(ip: &str, port: u16, local_port: u16) -> Result<UdpSocket, PunchError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| PunchError::Config(format!("invalid ip {}: {}", ip, e)))?;
    let remote = SocketAddr::new(ip, port);
    info!(%remote, "remote socket");

    let socket = bind_connected(remote, local_port).map_err(PunchError::Connection)?;
    if let Ok(local) = socket.local_addr() {
        info!(%local, "local socket");
    }
    Ok(socket)
}

fn bind_connected(remote: SocketAddr, local_port: u16) -> io::Result<UdpSocket> {
    let socket = reusable_udp_socket(local_port)?;
    socket.connect(&remote.into())?;
    UdpSocket::from_std(socket.into())
}

/// Send marker datagrams every interval until `done`, ramping TTL
async fn ping(
    socket: &UdpSocket,
    publisher: &dyn Publisher,
    done: &CancellationToken,
) -> Result<(), PunchError> {
    let remote = socket.peer_addr()?;
    let marker = format!("continuously pinging to {}", remote);

    let mut n: u32 = 1;
    loop {
        tokio::select! {
            _ = done.cancelled() => return Ok(()),
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }

        let ttl = ttl_for_attempt(n);
        trace!(ttl, "pinging..");
        if let Err(e) = send_ping(socket, marker.as_bytes(), ttl).await {
            publisher.publish(EVENT_TOPIC, Event::failure(STAGE_NAME, &e));
            return Err(e);
        }
        publisher.publish(EVENT_TOPIC, Event::success(STAGE_NAME));
        n = n.saturating_add(1);
    }
}

async fn send_ping(socket: &UdpSocket, marker: &[u8], ttl: u32) -> Result<(), PunchError> {
    socket.set_ttl(ttl).map_err(PunchError::Ttl)?;
    socket.send(marker).await?;
    Ok(())
}

/// Wait for the first datagram from the peer, then keep the pinger
/// running two more intervals so our pings cross the fresh hole
async fn receive(
    socket: &UdpSocket,
    timeout: Duration,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> Result<(), PunchError> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut buf = [0u8; READ_BUFFER];
    loop {
        tokio::select! {
            _ = &mut deadline => return Err(PunchError::TimedOut),
            _ = cancel.cancelled() => return Err(PunchError::Stopped),
            _ = stop.cancelled() => return Err(PunchError::Stopped),
            read = socket.recv(&mut buf) => match read {
                Ok(len) => {
                    debug!(data = %String::from_utf8_lossy(&buf[..len]), "remote peer data received");
                    break;
                }
                Err(e) => {
                    debug!("failed to read remote peer: {}", e);
                    tokio::time::sleep(PING_INTERVAL).await;
                }
            },
        }
    }

    tokio::select! {
        _ = tokio::time::sleep(PING_INTERVAL * KEEP_ALIVE_INTERVALS) => Ok(()),
        _ = cancel.cancelled() => Err(PunchError::Stopped),
        _ = stop.cancelled() => Err(PunchError::Stopped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::event::{EventBus, EventTracker};
    use crate::nat_traversal::types::JsonConfigParser;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;

    const PREVIOUS_STAGE: &str = "port_mapping";

    #[derive(Default)]
    struct RecordingProxy {
        registered: Mutex<Vec<ServiceType>>,
        availability_checks: AtomicUsize,
        handed_off: Mutex<Vec<(ServiceType, Option<SocketAddr>)>>,
    }

    impl RecordingProxy {
        fn handed_off(&self) -> Vec<(ServiceType, Option<SocketAddr>)> {
            self.handed_off.lock().unwrap().clone()
        }
    }

    impl NatProxy for RecordingProxy {
        fn is_available(&self, service_type: &ServiceType) -> bool {
            self.availability_checks.fetch_add(1, Ordering::SeqCst);
            self.registered.lock().unwrap().contains(service_type)
        }

        fn register_service_port(&self, service_type: ServiceType, _port: u16) {
            self.registered.lock().unwrap().push(service_type);
        }

        fn hand_off(&self, service_type: &ServiceType, socket: UdpSocket) {
            self.handed_off
                .lock()
                .unwrap()
                .push((service_type.clone(), socket.peer_addr().ok()));
        }
    }

    fn pinger(bus: &Arc<EventBus>, proxy: &Arc<RecordingProxy>) -> Arc<Pinger> {
        Arc::new(Pinger::new(
            Arc::new(EventTracker::new(bus)),
            Arc::new(JsonConfigParser),
            proxy.clone(),
            PREVIOUS_STAGE,
            bus.clone(),
        ))
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn target(port: u16, service_type: &str, local_port: u16) -> Params {
        Params {
            request_config: json!({"ip": "127.0.0.1", "port": port, "service_type": service_type}),
            port: local_port,
            cancel: CancellationToken::new(),
        }
    }

    async fn wait_for_state(pinger: &Pinger, expected: PingerState) {
        let mut states = pinger.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[test]
    fn ttl_ramps_then_opens() {
        assert_eq!((1..=4).map(ttl_for_attempt).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        for n in 5..300 {
            assert_eq!(ttl_for_attempt(n), 128);
        }
        assert_eq!(ttl_for_attempt(u32::MAX), 128);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_works_before_start() {
        let bus = Arc::new(EventBus::new());
        let pinger = pinger(&bus, &Arc::new(RecordingProxy::default()));
        pinger.stop();
        pinger.stop();

        tokio::time::timeout(Duration::from_secs(1), pinger.start())
            .await
            .unwrap();
        assert_eq!(pinger.state(), PingerState::Stopped);
        pinger.stop();
    }

    #[tokio::test]
    async fn stop_ends_a_running_loop() {
        let bus = Arc::new(EventBus::new());
        let pinger = pinger(&bus, &Arc::new(RecordingProxy::default()));
        let serving = tokio::spawn({
            let pinger = pinger.clone();
            async move { pinger.start().await }
        });

        bus.publish(EVENT_TOPIC, Event::failure(PREVIOUS_STAGE, "no upnp"));
        wait_for_state(&pinger, PingerState::Serving).await;

        pinger.stop();
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinger.state(), PingerState::Stopped);
    }

    #[tokio::test]
    async fn ping_target_does_not_block_without_listener() {
        let bus = Arc::new(EventBus::new());
        let pinger = pinger(&bus, &Arc::new(RecordingProxy::default()));

        // First target fills the mailbox, second one is dropped
        pinger.ping_target(target(1, "noop", 0)).await;
        let started = Instant::now();
        pinger.ping_target(target(1, "noop", 0)).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(90), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "blocked for {:?}", elapsed);
    }

    #[tokio::test]
    async fn successful_previous_stage_skips_punching() {
        let bus = Arc::new(EventBus::new());
        let pinger = pinger(&bus, &Arc::new(RecordingProxy::default()));

        bus.publish(EVENT_TOPIC, Event::success("unrelated"));
        bus.publish(EVENT_TOPIC, Event::success(PREVIOUS_STAGE));

        tokio::time::timeout(Duration::from_secs(1), pinger.start())
            .await
            .unwrap();
        assert_eq!(pinger.state(), PingerState::Skipped);
    }

    #[tokio::test]
    async fn unregistered_service_type_is_dropped() {
        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(RecordingProxy::default());
        let pinger = pinger(&bus, &proxy);
        let mut events = bus.subscribe(EVENT_TOPIC);

        let serving = tokio::spawn({
            let pinger = pinger.clone();
            async move { pinger.start().await }
        });
        bus.publish(EVENT_TOPIC, Event::failure(PREVIOUS_STAGE, "no upnp"));
        wait_for_state(&pinger, PingerState::Serving).await;

        pinger.ping_target(target(free_port(), "openvpn", 0)).await;
        pinger.ping_target(target(free_port(), "openvpn", 0)).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while proxy.availability_checks.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Nothing but the failure we published ourselves: no pings went out
        tokio::time::sleep(PING_INTERVAL * 2).await;
        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            stages.push(event.stage);
        }
        assert_eq!(stages, vec![PREVIOUS_STAGE.to_string()]);
        assert_eq!(pinger.state(), PingerState::Serving);

        pinger.stop();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_config_is_dropped() {
        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(RecordingProxy::default());
        let pinger = pinger(&bus, &proxy);
        let err = pinger
            .accept(Params {
                request_config: json!({"nothing": true}),
                port: 0,
                cancel: CancellationToken::new(),
            })
            .unwrap_err();
        assert!(matches!(err, PunchError::Config(_)));
        assert_eq!(proxy.availability_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ping_provider_times_out_on_silent_peer() {
        let bus = Arc::new(EventBus::new());
        let pinger = Pinger::new(
            Arc::new(EventTracker::new(&bus)),
            Arc::new(JsonConfigParser),
            Arc::new(RecordingProxy::default()),
            PREVIOUS_STAGE,
            bus.clone(),
        )
        .with_ping_timeout(Duration::from_millis(300));

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let result = pinger
            .ping_provider("127.0.0.1", port, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PunchError::TimedOut)));

        let mut buf = [0u8; READ_BUFFER];
        let len = silent.recv(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..len]).starts_with("continuously pinging to 127.0.0.1:"));
    }

    #[tokio::test]
    async fn ping_provider_honours_stop_signal() {
        let bus = Arc::new(EventBus::new());
        let pinger = pinger(&bus, &Arc::new(RecordingProxy::default()));
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let stop = CancellationToken::new();
        let cancel = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = pinger.ping_provider("127.0.0.1", port, &stop).await;
        assert!(matches!(result, Err(PunchError::Stopped)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn punches_between_provider_and_consumer() {
        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(RecordingProxy::default());
        let provider = pinger(&bus, &proxy);
        provider.bind_service_port(ServiceType::from("noop"), 1194);
        let mut events = bus.subscribe(EVENT_TOPIC);

        let provider_port = free_port();
        let consumer_port = free_port();

        let serving = tokio::spawn({
            let provider = provider.clone();
            async move { provider.start().await }
        });
        bus.publish(EVENT_TOPIC, Event::failure(PREVIOUS_STAGE, "no upnp"));
        provider
            .ping_target(target(consumer_port, "noop", provider_port))
            .await;

        let consumer = pinger(&Arc::new(EventBus::new()), &Arc::new(RecordingProxy::default()));
        consumer.bind_consumer_port(consumer_port);
        let socket = consumer
            .ping_provider("127.0.0.1", provider_port, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(socket.peer_addr().unwrap().port(), provider_port);

        tokio::time::timeout(Duration::from_secs(2), async {
            while proxy.handed_off().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let (service_type, remote) = proxy.handed_off().remove(0);
        assert_eq!(service_type, ServiceType::from("noop"));
        assert_eq!(remote.map(|a| a.port()), Some(consumer_port));

        let mut punched = false;
        while let Ok(event) = events.try_recv() {
            punched |= event.stage == STAGE_NAME && event.successful;
        }
        assert!(punched);

        provider.stop();
        serving.await.unwrap();
    }

    /// Answer the first datagram so the provider sees its hole open
    async fn answer_first_ping(socket: UdpSocket) {
        let mut buf = [0u8; READ_BUFFER];
        if let Ok((_, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(b"pong", from).await;
        }
    }

    async fn serving_provider(
        bus: &Arc<EventBus>,
        proxy: &Arc<RecordingProxy>,
    ) -> (Arc<Pinger>, tokio::task::JoinHandle<()>) {
        let provider = pinger(bus, proxy);
        provider.bind_service_port(ServiceType::from("noop"), 1194);
        let serving = tokio::spawn({
            let provider = provider.clone();
            async move { provider.start().await }
        });
        bus.publish(EVENT_TOPIC, Event::failure(PREVIOUS_STAGE, "no upnp"));
        wait_for_state(&provider, PingerState::Serving).await;
        (provider, serving)
    }

    async fn wait_for_hand_offs(proxy: &RecordingProxy, count: usize) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while proxy.handed_off().len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn concurrent_targets_punch_independently() {
        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(RecordingProxy::default());
        let (provider, serving) = serving_provider(&bus, &proxy).await;

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let first_port = first.local_addr().unwrap().port();
        let second_port = second.local_addr().unwrap().port();
        tokio::spawn(answer_first_ping(first));
        tokio::spawn(answer_first_ping(second));

        // Both targets are taken by the loop; neither waits for the other
        let started = Instant::now();
        provider.ping_target(target(first_port, "noop", 0)).await;
        provider.ping_target(target(second_port, "noop", 0)).await;
        assert!(started.elapsed() < Duration::from_millis(90), "serve loop blocked");

        wait_for_hand_offs(&proxy, 2).await;
        let mut remotes: Vec<u16> = proxy
            .handed_off()
            .into_iter()
            .filter_map(|(_, remote)| remote.map(|a| a.port()))
            .collect();
        remotes.sort_unstable();
        let mut expected = vec![first_port, second_port];
        expected.sort_unstable();
        assert_eq!(remotes, expected);
        assert_eq!(provider.state(), PingerState::Serving);

        provider.stop();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_target_is_abandoned_while_loop_keeps_serving() {
        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(RecordingProxy::default());
        let (provider, serving) = serving_provider(&bus, &proxy).await;

        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancelled = target(silent.local_addr().unwrap().port(), "noop", 0);
        let cancel = cancelled.cancel.clone();
        provider.ping_target(cancelled).await;

        // Pings reach the silent peer until the attempt is cancelled
        let mut buf = [0u8; READ_BUFFER];
        tokio::time::timeout(Duration::from_secs(1), silent.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        tokio::time::sleep(PING_INTERVAL * 2).await;
        while silent.try_recv(&mut buf).is_ok() {}
        let late = tokio::time::timeout(PING_INTERVAL * 3, silent.recv(&mut buf)).await;
        assert!(late.is_err(), "pinging continued after cancel");

        // The loop still serves new targets
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();
        tokio::spawn(answer_first_ping(peer));
        provider.ping_target(target(peer_port, "noop", 0)).await;

        wait_for_hand_offs(&proxy, 1).await;
        let handed_off = proxy.handed_off();
        assert_eq!(handed_off.len(), 1);
        assert_eq!(handed_off[0].1.map(|a| a.port()), Some(peer_port));
        assert_eq!(provider.state(), PingerState::Serving);

        provider.stop();
        serving.await.unwrap();
    }
}
