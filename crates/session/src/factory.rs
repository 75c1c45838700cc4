use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::bindings::{
    LocalClient, LocalServer, TcpClient, TcpServer, TokioClient, TokioServer, TransportRuntime,
    UdpClient, UdpServer,
};
use crate::client::NetworkClient;
use crate::config::{NetworkConfig, Protocol};
use crate::server::NetworkServer;
use crate::stats::{StatsClient, StatsServer};

/// Builds clients and servers for the protocol selected in a [`NetworkConfig`].
///
/// One factory shares a single tokio runtime between everything it builds,
/// and hands out a single loopback server that its loopback clients attach to.
pub struct NetworkFactory {
    config: NetworkConfig,
    runtime: RefCell<Option<TransportRuntime>>,
    loopback: RefCell<Option<Rc<LocalServer>>>,
}

impl NetworkFactory {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            runtime: RefCell::new(None),
            loopback: RefCell::new(None),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn runtime(&self) -> io::Result<TransportRuntime> {
        let mut runtime = self.runtime.borrow_mut();
        if let Some(runtime) = runtime.as_ref() {
            return Ok(runtime.clone());
        }
        let created = TransportRuntime::new()?;
        *runtime = Some(created.clone());
        Ok(created)
    }

    fn loopback(&self) -> Rc<LocalServer> {
        self.loopback
            .borrow_mut()
            .get_or_insert_with(|| Rc::new(LocalServer::new(self.config.server.max_clients)))
            .clone()
    }

    pub fn create_server(&self) -> io::Result<Rc<dyn NetworkServer>> {
        let server = &self.config.server;
        let server: Rc<dyn NetworkServer> = match self.config.protocol {
            Protocol::Tcp => Rc::new(TcpServer::from_config(server)),
            Protocol::UdpReliable => Rc::new(UdpServer::from_config(server, &self.config.udp)),
            Protocol::Loopback => self.loopback(),
            Protocol::Tokio => Rc::new(TokioServer::from_config(server, self.runtime()?)),
        };
        log::debug!("Created {} server", self.config.protocol);
        Ok(server)
    }

    pub fn create_client(&self) -> io::Result<Rc<dyn NetworkClient>> {
        let client = &self.config.client;
        let client: Rc<dyn NetworkClient> = match self.config.protocol {
            Protocol::Tcp => Rc::new(TcpClient::from_config(client)),
            Protocol::UdpReliable => Rc::new(UdpClient::from_config(client, &self.config.udp)),
            Protocol::Loopback => Rc::new(LocalClient::new(&self.loopback())),
            Protocol::Tokio => Rc::new(TokioClient::from_config(client, self.runtime()?)),
        };
        log::debug!("Created {} client", self.config.protocol);
        Ok(client)
    }

    /// A server wrapped in the heartbeat decorator.
    pub fn create_stats_server(&self) -> io::Result<Rc<StatsServer<dyn NetworkServer>>> {
        let inner = self.create_server()?;
        Ok(Rc::new(StatsServer::new(inner, &self.config.heartbeat)))
    }

    /// A client wrapped in the heartbeat decorator.
    pub fn create_stats_client(&self) -> io::Result<Rc<StatsClient<dyn NetworkClient>>> {
        let inner = self.create_client()?;
        Ok(Rc::new(StatsClient::new(inner, &self.config.heartbeat)))
    }
}
