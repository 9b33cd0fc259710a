//! Server-side datagram relay for UDP associations.
//!
//! One [`UdpRelay`] serves one association: a whitelisted socket faces the
//! client, an unrestricted one faces the remotes, and two tasks shuttle
//! datagrams between them. The relay applies the session guard to every
//! datagram in both directions, frames client-bound traffic with the relay
//! header, and tears itself down when the association goes idle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::authenticator::{Direction, SessionGuard};
use crate::config::SocksConfig;
use crate::error::{Result, SocksError};
use crate::message::{Address, UdpHeader};
use crate::protocol::FRAG_NONE;
use crate::udp::WhitelistedUdpSocket;

/// UdpRelay forwards datagrams for one UDP association.
pub struct UdpRelay {
    relay_addr: SocketAddr,
    client_task: JoinHandle<()>,
    remote_task: JoinHandle<()>,
    done: Arc<Notify>,
}

/// UdpRelay implementation block
impl UdpRelay {
    /// start brings up the relay for a client at `client`. A port of zero
    /// leaves the client's source port to be learned from its first
    /// datagram.
    pub async fn start(
        client: SocketAddr,
        guard: Arc<dyn SessionGuard>,
        config: &SocksConfig,
    ) -> Result<UdpRelay> {
        let client_socket = Arc::new(WhitelistedUdpSocket::bind(client).await?);
        let remote_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let relay_addr = client_socket.local_addr()?;
        debug!("UDP relay for {client} listening on {relay_addr}");

        let encapsulation = guard.encapsulation();
        let done = Arc::new(Notify::new());
        let budget = config.udp_timeout;
        let size = config.datagram_size;

        // Both directions share one activity clock so traffic either way
        // keeps the association alive
        let start = Instant::now();
        let last_activity = Arc::new(AtomicU64::new(0));
        let touch = {
            let last_activity = Arc::clone(&last_activity);
            move || {
                last_activity.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
            }
        };
        let idle_for = {
            let last_activity = Arc::clone(&last_activity);
            move || {
                let now = start.elapsed().as_millis() as u64;
                Duration::from_millis(now.saturating_sub(last_activity.load(Ordering::Relaxed)))
            }
        };

        let client_task = {
            let client_socket = Arc::clone(&client_socket);
            let remote_socket = Arc::clone(&remote_socket);
            let guard = Arc::clone(&guard);
            let encapsulation = Arc::clone(&encapsulation);
            let done = Arc::clone(&done);
            let touch = touch.clone();
            let idle_for = idle_for.clone();

            tokio::spawn(async move {
                let mut buf = vec![0u8; size];
                loop {
                    let (n, src) = match client_socket.recv_from(&mut buf, budget).await {
                        Ok(received) => received,
                        Err(SocksError::Timeout(_)) => {
                            if idle_for() >= budget {
                                debug!("UDP association idle, shutting relay down");
                                break;
                            }
                            continue;
                        }
                        Err(e) => {
                            warn!("client-side relay socket failed: {e}");
                            break;
                        }
                    };

                    if !guard.check_datagram(&buf[..n], Direction::ClientToRemote) {
                        debug!("guard dropped outbound datagram from {src}");
                        continue;
                    }
                    touch();

                    let plain = match encapsulation.unwrap(&buf[..n]) {
                        Ok(plain) => plain,
                        Err(e) => {
                            debug!("dropping undecodable datagram from {src}: {e}");
                            continue;
                        }
                    };
                    let (header, offset) = match UdpHeader::decode(&plain) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            debug!("dropping malformed datagram from {src}: {e}");
                            continue;
                        }
                    };
                    if header.frag != FRAG_NONE {
                        debug!("dropping fragmented datagram from {src}");
                        continue;
                    }

                    let ip = match header.addr.resolve().await {
                        Ok(ip) => ip,
                        Err(e) => {
                            debug!("dropping datagram for unresolvable {}: {e}", header.addr);
                            continue;
                        }
                    };
                    if let Err(e) = remote_socket.send_to(&plain[offset..], (ip, header.port)).await
                    {
                        debug!("relay send to {ip}:{} failed: {e}", header.port);
                    }
                }
                done.notify_one();
            })
        };

        let remote_task = {
            let client_socket = Arc::clone(&client_socket);
            let remote_socket = Arc::clone(&remote_socket);
            let done = Arc::clone(&done);

            tokio::spawn(async move {
                let mut buf = vec![0u8; size];
                loop {
                    let (n, src) = match timeout(budget, remote_socket.recv_from(&mut buf)).await {
                        Ok(Ok(received)) => received,
                        Ok(Err(e)) => {
                            warn!("remote-side relay socket failed: {e}");
                            break;
                        }
                        Err(_) => {
                            if idle_for() >= budget {
                                break;
                            }
                            continue;
                        }
                    };

                    if !guard.check_datagram(&buf[..n], Direction::RemoteToClient) {
                        debug!("guard dropped inbound datagram from {src}");
                        continue;
                    }
                    touch();

                    let src = match src {
                        SocketAddr::V4(v4) => v4,
                        SocketAddr::V6(_) => {
                            debug!("dropping IPv6 datagram from {src}");
                            continue;
                        }
                    };

                    let header = UdpHeader::new(Address::Ip(*src.ip()), src.port());
                    let packet = match header.encode(&buf[..n]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("could not frame datagram from {src}: {e}");
                            continue;
                        }
                    };
                    let packet = match encapsulation.wrap(&packet) {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("could not encapsulate datagram from {src}: {e}");
                            continue;
                        }
                    };

                    // No client endpoint locked yet: nowhere to deliver
                    match client_socket.send(&packet).await {
                        Ok(_) => {}
                        Err(SocksError::Io(e))
                            if e.kind() == std::io::ErrorKind::NotConnected =>
                        {
                            debug!("dropping datagram from {src}, client endpoint unknown");
                        }
                        Err(e) => {
                            warn!("relay send to client failed: {e}");
                        }
                    }
                }
                done.notify_one();
            })
        };

        Ok(UdpRelay {
            relay_addr,
            client_task,
            remote_task,
            done,
        })
    }

    /// relay_addr returns the client-facing endpoint to advertise in the
    /// association reply.
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// closed resolves once either relay direction has shut down.
    pub async fn closed(&self) {
        self.done.notified().await;
    }

    /// shutdown stops both relay tasks.
    pub fn shutdown(self) {
        self.client_task.abort();
        self.remote_task.abort();
    }
}
