use anyhow::{Context, Result};
use natdial::communication::{Contact, TopicAddress, TransportError};
use natdial::identity::{key_verifier_factory, Identity, Signer};
use natdial::nat_traversal::{
    public_address, Event, EventBus, EventTracker, JsonConfigParser, Pinger, Publisher,
    UdpRelayProxy, EVENT_TOPIC, PORT_MAPPING_STAGE,
};
use natdial::{DialogEstablisher, DialogWaiter, NodeConfig, SessionConsumer, SessionProvider};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    init_logging();

    match args[1].as_str() {
        "serve" => run_provider()?,
        "connect" => {
            if args.len() < 4 {
                eprintln!("Usage: {} connect <provider_identity> <provider_topic>", args[0]);
                eprintln!();
                eprintln!("The provider prints both when it starts serving.");
                std::process::exit(1);
            }
            run_consumer(&args[2], &args[3])?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_usage(program_name: &str) {
    eprintln!("natdial - authenticated dialogs and UDP hole punching between peers");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} serve                                        # Provider mode", program_name);
    eprintln!("  {} connect <provider_identity> <provider_topic> # Consumer mode", program_name);
    eprintln!();
    eprintln!("  Environment variables:");
    eprintln!("    BROKER_URL          NATS broker WebSocket url (required)");
    eprintln!("                        Example: wss://broker.example.com:443");
    eprintln!("    IDENTITY_KEY        Hex encoded Ed25519 secret (default: random identity)");
    eprintln!("    STUN_SERVER         STUN server host:port (default: stun.l.google.com:19302)");
    eprintln!("    SERVICE_TYPE        Service to provide or consume (default: openvpn)");
    eprintln!("    SERVICE_PORT        Local port of the provided service (default: 1194)");
    eprintln!("    PROVIDER_PORT       UDP port the provider punches from (default: 40000)");
    eprintln!("    CONSUMER_PORT       UDP port the consumer punches from (default: 40001)");
    eprintln!("    REQUEST_TIMEOUT_MS  Dialog request timeout (default: 10000)");
    eprintln!("    ALLOW_INVALID_CERTS Accept self-signed broker certificates (default: false)");
    eprintln!();
    eprintln!("  Logging is controlled with RUST_LOG (default: info).");
}

fn new_pinger(bus: &Arc<EventBus>, proxy: Arc<UdpRelayProxy>) -> Arc<Pinger> {
    Arc::new(Pinger::new(
        Arc::new(EventTracker::new(bus)),
        Arc::new(JsonConfigParser),
        proxy,
        PORT_MAPPING_STAGE,
        bus.clone(),
    ))
}

/// Serve dialogs and punch towards every consumer that creates a session
fn run_provider() -> Result<()> {
    let config = NodeConfig::from_env()?;
    let signer = Arc::new(config.signer()?);
    let identity = signer.identity();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let public = public_address(&config.stun_server, config.provider_port)
            .await
            .context("STUN discovery failed")?;

        let bus = Arc::new(EventBus::new());
        let proxy = Arc::new(UdpRelayProxy::new());
        let pinger = new_pinger(&bus, proxy.clone());
        pinger.bind_service_port(config.service_type.clone(), config.service_port);

        let serving = tokio::spawn({
            let pinger = pinger.clone();
            async move { pinger.start().await }
        });
        // No port mapping stage runs on this node, go straight to punching
        bus.publish(
            EVENT_TOPIC,
            Event::failure(PORT_MAPPING_STAGE, "port mapping not available"),
        );

        let mut address = TopicAddress::new(&identity.address, vec![config.broker_url.clone()])
            .allow_invalid_certs(config.allow_invalid_certs);
        address.connect().await.context("Failed to connect to broker")?;

        let waiter = DialogWaiter::new(address, signer.clone(), key_verifier_factory());
        let provider = Arc::new(SessionProvider::new(
            pinger.clone(),
            config.service_type.clone(),
            config.provider_port,
            public,
        ));
        provider.serve(&waiter).await?;

        info!(%identity, topic = %waiter.address().topic(), %public, "provider ready");
        println!("Provider identity : {}", identity);
        println!("Provider topic    : {}", waiter.address().topic());

        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        waiter.stop().await;
        provider.stop().await;
        pinger.stop();
        proxy.stop();
        serving.await?;
        waiter.address().disconnect();
        Ok::<(), anyhow::Error>(())
    })
}

/// Create a session with the provider and keep the punched socket open
fn run_consumer(provider: &str, topic: &str) -> Result<()> {
    let config = NodeConfig::from_env()?;
    let signer = Arc::new(config.signer()?);
    let provider_id = Identity::from_address(provider);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let public = public_address(&config.stun_server, config.consumer_port)
            .await
            .context("STUN discovery failed")?;

        let allow_invalid_certs = config.allow_invalid_certs;
        let establisher = DialogEstablisher::new(signer.clone(), key_verifier_factory())
            .with_timeout(config.request_timeout)
            .with_address_factory(Arc::new(
                move |contact: &Contact| -> Result<TopicAddress, TransportError> {
                    Ok(TopicAddress::for_contact(contact)?.allow_invalid_certs(allow_invalid_certs))
                },
            ));

        let bus = Arc::new(EventBus::new());
        let pinger = new_pinger(&bus, Arc::new(UdpRelayProxy::new()));
        let consumer = SessionConsumer::new(
            establisher,
            pinger,
            config.service_type.clone(),
            config.consumer_port,
            public,
        );

        let stop = CancellationToken::new();
        tokio::spawn({
            let stop = stop.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.cancel();
                }
            }
        });

        let contact = TopicAddress::new(topic, vec![config.broker_url.clone()]).contact();
        let session = consumer
            .connect(&provider_id, &contact, &stop)
            .await
            .context("Session setup failed")?;

        info!(
            session = %session.id,
            local = ?session.socket.local_addr().ok(),
            remote = ?session.socket.peer_addr().ok(),
            "session established"
        );
        println!("Session {} established with {}", session.id, provider_id);

        stop.cancelled().await;
        session.dialog.close().await;
        Ok::<(), anyhow::Error>(())
    })
}
