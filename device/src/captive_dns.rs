use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
};

use bridge_common::{
    dns::{captive_reply, query_name},
    hal::{DnsResponder, PlatformError},
};
use log::{debug, info, warn};

const MAX_DATAGRAM: usize = 512;

/// Non-blocking UDP responder that points every A query at the portal.
pub struct UdpCaptiveDns {
    port_override: Option<u16>,
    socket: Option<UdpSocket>,
    answer: Ipv4Addr,
}

impl UdpCaptiveDns {
    pub fn new(port_override: Option<u16>) -> Self {
        Self {
            port_override,
            socket: None,
            answer: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl DnsResponder for UdpCaptiveDns {
    fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), PlatformError> {
        let port = self.port_override.unwrap_or(port);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let socket = UdpSocket::bind(addr)
            .map_err(|err| PlatformError::Dns(format!("bind {addr}: {err}")))?;
        socket.set_nonblocking(true)?;

        info!("captive DNS answering {answer} on udp/{port}");
        self.socket = Some(socket);
        self.answer = answer;
        Ok(())
    }

    fn process_next_request(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut buffer = [0_u8; MAX_DATAGRAM];
        let (len, peer) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!("captive DNS receive failed: {err}");
                return;
            }
        };

        let query = &buffer[..len];
        let Some(reply) = captive_reply(query, self.answer) else {
            debug!("ignoring malformed DNS datagram from {peer}");
            return;
        };
        debug!(
            "captive DNS {} -> {}",
            query_name(query).unwrap_or_default(),
            self.answer
        );
        if let Err(err) = socket.send_to(&reply, peer) {
            warn!("captive DNS reply to {peer} failed: {err}");
        }
    }

    fn stop(&mut self) {
        self.socket = None;
    }
}
