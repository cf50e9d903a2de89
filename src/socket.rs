//! Socket adapters: the datagram capability an endpoint drives.
//!
//! An adapter runs as its own task, owned by exactly one endpoint. It takes
//! `send`/`close` commands, pushes received datagrams up, and announces its
//! own exit so the endpoint can decide whether to replace it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

/// An adapter closes itself after this long with no traffic either way.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// A datagram transport. `coap://` URLs get the UDP implementation below;
/// anything else (secured transports included) is supplied by the caller.
#[async_trait]
pub trait SocketAdapter: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn set_broadcast(&self, _on: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "broadcast not supported by this adapter",
        ))
    }
}

/// Opens adapters: once at endpoint start, and again if a live adapter dies
/// and the endpoint replaces it.
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    async fn open(&self) -> io::Result<Box<dyn SocketAdapter>>;
}

pub struct UdpAdapter {
    socket: UdpSocket,
}

impl UdpAdapter {
    pub async fn bind(addr: SocketAddr) -> io::Result<UdpAdapter> {
        Ok(UdpAdapter {
            socket: UdpSocket::bind(addr).await?,
        })
    }
}

#[async_trait]
impl SocketAdapter for UdpAdapter {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn set_broadcast(&self, on: bool) -> io::Result<()> {
        self.socket.set_broadcast(on)
    }
}

/// Reopens plain UDP sockets on a fixed bind address.
pub struct UdpFactory {
    bind: SocketAddr,
}

impl UdpFactory {
    /// A server factory bound to a known address.
    pub fn bind(addr: SocketAddr) -> UdpFactory {
        UdpFactory { bind: addr }
    }

    /// A client factory: ephemeral port in the peer's address family.
    pub fn client_for(peer: SocketAddr) -> UdpFactory {
        let bind = if peer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        UdpFactory { bind }
    }
}

#[async_trait]
impl AdapterFactory for UdpFactory {
    async fn open(&self) -> io::Result<Box<dyn SocketAdapter>> {
        Ok(Box::new(UdpAdapter::bind(self.bind).await?))
    }
}

#[derive(Debug)]
pub(crate) enum AdapterCmd {
    Send(Vec<u8>, SocketAddr),
    SetBroadcast(bool, oneshot::Sender<io::Result<()>>),
    Close,
}

#[derive(Debug)]
pub(crate) enum AdapterEvent {
    Recv(Vec<u8>, SocketAddr),
    /// The adapter task is gone. `None` means a deliberate or idle close.
    Exited(Option<io::Error>),
}

#[derive(Clone)]
pub(crate) struct AdapterHandle {
    pub cmd: mpsc::Sender<AdapterCmd>,
}

/// Run an adapter as a task. The endpoint observes the task rather than
/// being tied to it: adapter death arrives as an [`AdapterEvent::Exited`].
pub(crate) fn spawn(
    adapter: Box<dyn SocketAdapter>,
    events: mpsc::Sender<AdapterEvent>,
) -> AdapterHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<AdapterCmd>(32);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        let exit = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(AdapterCmd::Send(bytes, to)) => {
                        match adapter.send_to(&bytes, to).await {
                            Ok(written) if written == bytes.len() => {}
                            Ok(written) => {
                                warn!("socket: short write, {} of {} bytes", written, bytes.len())
                            }
                            Err(error) => break Some(error),
                        }
                    }
                    Some(AdapterCmd::SetBroadcast(on, reply)) => {
                        let _ = reply.send(adapter.set_broadcast(on));
                    }
                    Some(AdapterCmd::Close) | None => break None,
                },
                received = adapter.recv_from(&mut buf) => match received {
                    Ok((read, from)) => {
                        let datagram = buf[..read].to_vec();
                        if events.send(AdapterEvent::Recv(datagram, from)).await.is_err() {
                            break None;
                        }
                    }
                    Err(error) => break Some(error),
                },
                _ = sleep(INACTIVITY_TIMEOUT) => {
                    debug!("socket: idle for {:?}, closing", INACTIVITY_TIMEOUT);
                    break None;
                }
            }
        };
        let _ = events.send(AdapterEvent::Exited(exit)).await;
    });
    AdapterHandle { cmd: cmd_tx }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_udp_adapter_round_trip() {
        let a = UdpAdapter::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpAdapter::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let to = b.local_addr().unwrap();
        a.send_to(b"ping", to).await.unwrap();

        let mut buf = [0u8; 64];
        let (read, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_adapter_task_send_and_recv() {
        let listener = UdpAdapter::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let factory = UdpFactory::client_for(listener_addr);
        let adapter = factory.open().await.unwrap();
        let adapter_addr = adapter.local_addr().unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = spawn(adapter, events_tx);

        handle
            .cmd
            .send(AdapterCmd::Send(b"hello".to_vec(), listener_addr))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (read, from) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"hello");
        assert_eq!(from, adapter_addr);

        listener.send_to(b"echo", adapter_addr).await.unwrap();
        match events_rx.recv().await.unwrap() {
            AdapterEvent::Recv(bytes, src) => {
                assert_eq!(bytes, b"echo");
                assert_eq!(src, listener_addr);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_adapter_task_close() {
        let factory = UdpFactory::bind("127.0.0.1:0".parse().unwrap());
        let adapter = factory.open().await.unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let handle = spawn(adapter, events_tx);

        handle.cmd.send(AdapterCmd::Close).await.unwrap();
        match events_rx.recv().await.unwrap() {
            AdapterEvent::Exited(None) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
}
