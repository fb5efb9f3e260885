// AgriNet Node - Host daemon for a coordinator and relay pair
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # AgriNet Node
//!
//! Runs a coordinator and its relay in one process: a simulated sensor field,
//! the control engine with file-backed configuration, and a CoAP session to
//! the collector over UDP.
//!
//! ## Usage
//!
//! ```bash
//! # Six simulated peers over three rows, collector on localhost
//! agrinet-node --peers 6 --groups 3 --server 127.0.0.1:5683
//!
//! # Faster cycles for a bench test
//! agrinet-node --measurement-period 5 --relay-period 15 --log-level debug
//! ```

mod transport;

use agrinet_coordinator::{
    Clock, ConfigStore, ControlEngine, ControlEvent, ControlHandle, Coordinator,
    CoordinatorConfig, CoordinatorError, FileStore, InboundDispatcher, InboundOutcome, OutputLog,
    PersistQueue, RelayEndpoint, RelayInventory, RelayLoopback, SessionDriver, SessionState,
    SimulatedRadio, SystemClock,
};
use agrinet::RetryStrategy;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::block_in_place;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use transport::UdpTransport;

/// Period of the radio event pump between sweeps
const LINK_EVENT_PERIOD: Duration = Duration::from_millis(500);

/// Granularity of the observe renewal check
const RENEW_CHECK_PERIOD: Duration = Duration::from_secs(1);

type Relay = RelayLoopback<OutputLog>;

/// AgriNet row coordinator daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Collector address (host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Number of simulated sensor peers (at most 255)
    #[arg(short, long, default_value = "6")]
    peers: u8,

    /// Number of groups the simulated peers are spread over
    #[arg(short, long, default_value = "3")]
    groups: u8,

    /// Directory holding the persistent configuration records
    #[arg(short, long, default_value = "agrinet-data")]
    data_dir: PathBuf,

    /// Seconds between measurement sweeps
    #[arg(long)]
    measurement_period: Option<u64>,

    /// Seconds between relays toward the collector
    #[arg(long)]
    relay_period: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "AgriNet node v{} (protocol v{})",
        env!("CARGO_PKG_VERSION"),
        agrinet::VERSION
    );

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<CoordinatorConfig, CoordinatorError> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(server) = &args.server {
        config.session.server = server.clone();
    }
    if let Some(period) = args.measurement_period {
        config.measurement_period_secs = period;
    }
    if let Some(period) = args.relay_period {
        config.relay_period_secs = period;
    }
    if args.groups == 0 || usize::from(args.groups) > agrinet::MAX_GROUPS {
        return Err(CoordinatorError::InvalidConfig(format!(
            "--groups must be between 1 and {}",
            agrinet::MAX_GROUPS
        )));
    }
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> Result<(), CoordinatorError> {
    let config = load_config(&args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn ConfigStore> = Arc::new(FileStore::open(&args.data_dir)?);
    let queue = PersistQueue::spawn(Arc::clone(&store))?;
    let engine = ControlEngine::new(store, queue.handle()).into_shared();

    let inventory = RelayInventory::new(config.max_peers).into_shared();
    let data_ready = Arc::new(Notify::new());
    let ready_signal = Arc::clone(&data_ready);
    let relay = RelayLoopback::new(RelayEndpoint::new(
        Arc::clone(&inventory),
        OutputLog::new(),
        Arc::clone(&clock),
    ))
    .with_ready_hook(move || ready_signal.notify_one());

    let radio = SimulatedRadio::with_field(args.peers, args.groups);
    let mut coordinator = Coordinator::new(
        radio,
        relay,
        Arc::clone(&engine),
        Arc::clone(&clock),
        &config,
    );
    coordinator.start()?;
    let connected = coordinator.process_link_events();
    info!(
        peers = connected,
        groups = args.groups,
        period_secs = config.measurement_period_secs,
        relay_every = config.relay_every_cycles(),
        "Coordinator started"
    );

    let transport = Arc::new(UdpTransport::new(config.session.server.clone()));
    let user_request = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_link = coordinator.relay_link();
    let inbound = InboundDispatcher::new(Arc::clone(&engine), config.session.observe_token)
        .with_forwarder(move |frame| {
            let mut link = relay_link
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(message) = link.on_frame(&frame) {
                info!("Collector frame {} passed to the coordinator", message.message_type());
            }
        });
    let session = SessionDriver::new(
        Arc::clone(&transport),
        config.session.clone(),
        inventory,
        clock,
    );
    let control = coordinator.control_handle();

    let tasks = vec![
        tokio::spawn(measurement_loop(
            coordinator,
            config.measurement_period(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(control_loop(
            control,
            Arc::clone(&user_request),
            shutdown_rx.clone(),
        )),
        tokio::spawn(session_loop(
            session,
            config.session.init_retry(),
            data_ready,
            shutdown_rx.clone(),
        )),
        tokio::spawn(inbound_loop(
            inbound,
            transport,
            config.session.inbound_poll(),
            user_request,
            shutdown_rx,
        )),
    ];

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    queue.shutdown();
    Ok(())
}

/// Resolves once shutdown was requested
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn measurement_loop(
    mut coordinator: Coordinator<SimulatedRadio, Relay>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = interval(period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut link_events = interval(LINK_EVENT_PERIOD);

    loop {
        tokio::select! {
            _ = sweep.tick() => match block_in_place(|| coordinator.on_timer()) {
                Ok(report) => info!(
                    readings = report.readings,
                    timeouts = report.timeouts,
                    relayed = report.relayed,
                    reset = report.reset,
                    "Measurement sweep"
                ),
                Err(e) => warn!("Measurement sweep failed: {}", e),
            },
            _ = link_events.tick() => {
                let ready = coordinator.process_link_events();
                if ready > 0 {
                    info!(ready, occupied = coordinator.link().occupied(), "Peers connected");
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn control_loop(
    control: ControlHandle<Relay>,
    user_request: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = user_request.notified() => {
                match block_in_place(|| control.handle(ControlEvent::UserRequest)) {
                    Ok(Some(command)) => debug!("Actuators after user request: {:?}", command.groups),
                    Ok(None) => {}
                    Err(e) => warn!("Actuator command not delivered: {}", e),
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}

async fn session_loop(
    mut session: SessionDriver<UdpTransport>,
    retry: RetryStrategy,
    data_ready: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut renew = interval(RENEW_CHECK_PERIOD);
    let mut attempt = 0;

    loop {
        if session.state() == SessionState::Init {
            match session.start() {
                Ok(published) => {
                    attempt = 0;
                    info!(published, "Session established");
                }
                Err(e) => {
                    let Some(backoff) = retry.delay_for_attempt(attempt) else {
                        error!("Session not established: {}, giving up", e);
                        break;
                    };
                    attempt += 1;
                    warn!(attempt, "Session not established: {}, retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = sleep(backoff) => continue,
                        _ = stopped(&mut shutdown) => break,
                    }
                }
            }
        }

        tokio::select! {
            _ = data_ready.notified() => match session.on_data_ready() {
                Ok(published) => info!(published, "Aggregates published"),
                Err(e) => warn!("Publishing failed: {}", e),
            },
            _ = renew.tick() => {
                if let Err(e) = session.renew_if_due() {
                    warn!("Observe renewal failed: {}", e);
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
    debug!("Session stats: {:?}", session.stats());
}

async fn inbound_loop(
    mut inbound: InboundDispatcher,
    transport: Arc<UdpTransport>,
    period: Duration,
    user_request: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = interval(period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = poll.tick() => match inbound.poll(transport.as_ref()) {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            InboundOutcome::Applied { group } => {
                                info!(group, "User update applied");
                                user_request.notify_one();
                            }
                            InboundOutcome::Forwarded(kind) => debug!("Forwarded {}", kind),
                            InboundOutcome::Dropped(reason) => {
                                warn!("Inbound datagram dropped: {:?}", reason)
                            }
                        }
                    }
                }
                Err(e) => warn!("Inbound receive failed: {}", e),
            },
            _ = stopped(&mut shutdown) => break,
        }
    }
    debug!("Inbound stats: {:?}", inbound.stats());
}
