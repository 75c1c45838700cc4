use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use netsession::bindings::udp::PacketLossSimulation;
use netsession::{
    ClientDelegate, ClientId, MessageData, NetworkClient, NetworkConfig, NetworkError,
    NetworkFactory, NetworkServer, Protocol, ReceivedMessage, ServerDelegate, StatsClient,
    StatsServer, UpdateScheduler,
};

const ECHO_TYPE: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
    /// Server and client in one process, the only useful mode for loopback.
    Both,
}

#[derive(Parser)]
#[command(name = "netsession-echo")]
#[command(about = "Echo server and client over any netsession transport")]
struct Args {
    #[arg(value_enum)]
    mode: Mode,

    /// tcp, udp, loopback or tokio. Overrides the config file.
    #[arg(long)]
    protocol: Option<Protocol>,

    #[arg(short, long)]
    address: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// TOML file with a full network configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    /// Messages the client sends before disconnecting.
    #[arg(short = 'n', long, default_value_t = 5)]
    count: usize,

    /// Seconds the server runs before shutting down; runs forever when omitted.
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long, help = "Packet loss percentage (0-100) for the udp transport")]
    loss_percent: Option<f32>,
}

impl Args {
    fn network_config(&self) -> Result<NetworkConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => NetworkConfig::default(),
        };

        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(address) = &self.address {
            config.server.bind_address = address.clone();
            config.client.server_address = address.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
            config.client.port = port;
        }
        if let Some(loss_percent) = self.loss_percent {
            config.udp.loss_simulation = Some(PacketLossSimulation::lossy(loss_percent));
        }
        Ok(config)
    }
}

struct EchoServer {
    server: Weak<StatsServer<dyn NetworkServer>>,
}

impl ServerDelegate for EchoServer {
    fn on_started(&self) {
        log::info!("Echo server running");
    }

    fn on_stopped(&self) {
        log::info!("Echo server stopped");
    }

    fn on_client_connected(&self, client_id: ClientId) {
        log::info!("Client {} connected", client_id);
    }

    fn on_client_disconnected(&self, client_id: ClientId) {
        log::info!("Client {} disconnected", client_id);
    }

    fn on_message_received(&self, client_id: ClientId, message: &ReceivedMessage) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let text = match message.decode::<String>() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Client {} sent an unreadable message: {}", client_id, e);
                return;
            }
        };

        log::debug!("Echoing {:?} to client {}", text, client_id);
        let reply = message.data().to_client(client_id);
        if let Err(e) = server.send_message(reply, &text) {
            log::warn!("Echo to client {} failed: {}", client_id, e);
        }
    }

    fn on_error(&self, error: &NetworkError) {
        log::warn!("Server error: {}", error);
    }
}

#[derive(Default)]
struct EchoClient {
    connected: Cell<bool>,
    disconnected: Cell<bool>,
    echoes: RefCell<Vec<String>>,
    failure: RefCell<Option<NetworkError>>,
}

impl ClientDelegate for EchoClient {
    fn on_connected(&self) {
        log::info!("Connected");
        self.connected.set(true);
    }

    fn on_disconnected(&self) {
        log::info!("Disconnected");
        self.disconnected.set(true);
    }

    fn on_message_received(&self, message: &ReceivedMessage) {
        match message.decode::<String>() {
            Ok(text) => {
                log::info!("Echo: {}", text);
                self.echoes.borrow_mut().push(text);
            }
            Err(e) => log::warn!("Unreadable echo: {}", e),
        }
    }

    fn on_error(&self, error: &NetworkError) {
        log::warn!("Client error: {}", error);
        if matches!(error, NetworkError::Transport { .. }) {
            self.failure.borrow_mut().replace(error.clone());
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.network_config()?;
    log::info!("Using {} transport", config.protocol);

    if args.mode == Mode::Client && config.protocol == Protocol::Loopback {
        bail!("the loopback transport needs a server in the same process; use `both`");
    }

    let factory = NetworkFactory::new(config);
    let mut scheduler = UpdateScheduler::new(args.tick_rate);

    let server = match args.mode {
        Mode::Server | Mode::Both => Some(start_server(&factory, &scheduler)?),
        Mode::Client => None,
    };

    match args.mode {
        Mode::Server => {
            let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            run_until(&mut scheduler, || {
                deadline.is_some_and(|deadline| Instant::now() >= deadline)
            });
        }
        Mode::Client | Mode::Both => run_client(&factory, &mut scheduler, args.count)?,
    }

    if let Some(server) = server {
        server.stop();
    }
    Ok(())
}

fn start_server(
    factory: &NetworkFactory,
    scheduler: &UpdateScheduler,
) -> Result<Rc<StatsServer<dyn NetworkServer>>> {
    let server = factory
        .create_stats_server()
        .context("creating server")?;
    server.add_delegate(Rc::new(EchoServer {
        server: Rc::downgrade(&server),
    }));
    server.start();
    if !server.running() {
        bail!("server failed to start on {}", factory.config().server.bind_addr());
    }
    scheduler.add(server.clone());
    Ok(server)
}

fn run_client(
    factory: &NetworkFactory,
    scheduler: &mut UpdateScheduler,
    count: usize,
) -> Result<()> {
    let client: Rc<StatsClient<dyn NetworkClient>> = factory
        .create_stats_client()
        .context("creating client")?;
    let state = Rc::new(EchoClient::default());
    client.add_delegate(state.clone());
    scheduler.add(client.clone());

    log::info!("Connecting to {}", factory.config().client.server_addr());
    client.connect();
    run_until(scheduler, || {
        state.connected.get() || state.failure.borrow().is_some()
    });
    if let Some(err) = state.failure.borrow_mut().take() {
        bail!("connection failed: {}", err);
    }

    for i in 0..count {
        let text = format!("hello #{}", i + 1);
        client
            .send_message(MessageData::new(ECHO_TYPE), &text)
            .context("sending message")?;
    }

    let started = Instant::now();
    let timeout = factory.config().client.connect_timeout();
    run_until(scheduler, || {
        state.echoes.borrow().len() >= count
            || state.disconnected.get()
            || started.elapsed() > timeout
    });

    let received = state.echoes.borrow().len();
    match client.latency() {
        Some(latency) => {
            log::info!("Received {}/{} echoes, latency {:?}", received, count, latency)
        }
        None => log::info!("Received {}/{} echoes", received, count),
    }

    client.disconnect();
    scheduler.remove(&*client);
    if received < count {
        bail!("only {} of {} echoes arrived", received, count);
    }
    Ok(())
}

/// Drives the scheduler on wall-clock time until `done` returns true.
fn run_until(scheduler: &mut UpdateScheduler, mut done: impl FnMut() -> bool) {
    let mut last = Instant::now();
    while !done() {
        let now = Instant::now();
        scheduler.advance(now - last);
        last = now;
        thread::sleep(scheduler.tick_interval());
    }
}
