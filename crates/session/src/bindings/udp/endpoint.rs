use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use super::protocol::{Datagram, MAX_DATAGRAM_SIZE};
use super::simulator::{NetworkSimulator, PacketLossSimulation, rand_u64};

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Datagrams discarded by the loss simulation.
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub packets_resent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A non-blocking UDP socket speaking [`Datagram`]s.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
    simulator: Option<NetworkSimulator>,
    #[cfg(test)]
    injected_error: Option<io::Error>,
}

impl UdpEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
            simulator: None,
            #[cfg(test)]
            injected_error: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_loss_simulation(&mut self, config: Option<PacketLossSimulation>) {
        self.simulator = config
            .filter(|config| config.enabled)
            .map(|config| NetworkSimulator::new(config, rand_u64()));
    }

    pub fn set_simulator(&mut self, simulator: NetworkSimulator) {
        self.simulator = Some(simulator);
    }

    pub fn send_to(&mut self, datagram: &Datagram, addr: SocketAddr) -> io::Result<()> {
        let data = datagram
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if let Some(simulator) = self.simulator.as_mut() {
            if !simulator.enqueue(data, addr, Instant::now()) {
                self.stats.packets_dropped += 1;
            }
            return self.flush_delayed();
        }

        self.send_raw(&data, addr)
    }

    pub fn record_resend(&mut self) {
        self.stats.packets_resent += 1;
    }

    fn send_raw(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                Ok(())
            }
            // A full send buffer loses the datagram like the network would.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sends every simulated datagram whose delay has elapsed.
    pub fn flush_delayed(&mut self) -> io::Result<()> {
        let ready = match self.simulator.as_mut() {
            Some(simulator) => simulator.take_ready(Instant::now()),
            None => return Ok(()),
        };
        for (data, addr) in ready {
            self.send_raw(&data, addr)?;
        }
        Ok(())
    }

    /// Makes the next [`receive`](Self::receive) fail with `error`.
    #[cfg(test)]
    pub(crate) fn inject_receive_error(&mut self, error: io::Error) {
        self.injected_error = Some(error);
    }

    #[cfg(test)]
    fn take_injected_error(&mut self) -> io::Result<()> {
        self.injected_error.take().map_or(Ok(()), Err)
    }

    #[cfg(not(test))]
    fn take_injected_error(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Drains the socket. Undecodable datagrams are counted and skipped.
    pub fn receive(&mut self) -> io::Result<Vec<(Datagram, SocketAddr)>> {
        self.take_injected_error()?;

        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => match Datagram::deserialize(&self.recv_buffer[..size]) {
                    Ok(datagram) if datagram.header.is_valid() => {
                        self.stats.packets_received += 1;
                        self.stats.bytes_received += size as u64;
                        datagrams.push((datagram, addr));
                    }
                    _ => self.stats.packets_invalid += 1,
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable from an earlier send surfaces here on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }
}
