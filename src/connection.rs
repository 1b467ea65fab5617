use crate::error::{ParseError, Result, WmpError};
use crate::protocol::{Command, Message, WmpCodec};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Frame forwarded from the socket reader to the session engine
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Message),
    Malformed(ParseError),
    /// The socket failed or the gateway closed it; sent at most once
    Closed,
}

pub(crate) type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Low-level TCP connection to a gateway
///
/// Owns the socket through two tasks: a writer fed by an unbounded channel,
/// so whole lines are written one after another, and a reader that decodes
/// lines and forwards them to the inbound queue without interpreting them.
/// It never reconnects on its own.
pub(crate) struct Connection {
    addr: String,
    outbound: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Connect to `host:port`, giving up after `connect_timeout`
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<(Self, InboundReceiver)> {
        let addr = format!("{}:{}", host, port);
        tracing::info!("Connecting to {}", addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(WmpError::Connect {
                    addr,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(WmpError::Connect {
                    addr,
                    detail: format!("timed out after {:?}", connect_timeout),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        let (mut write, mut read) = Framed::new(stream, WmpCodec::new()).split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Command>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let open = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        // Forward outgoing commands to the socket
        let lost = ConnectionLost::new(open.clone(), shutdown.clone(), inbound_tx.clone());
        let writer_shutdown = shutdown.clone();
        let writer_addr = addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    command = outbound_rx.recv() => {
                        let Some(command) = command else { break };
                        tracing::debug!("Sending: {}", command.encode());
                        if let Err(e) = write.send(command).await {
                            tracing::error!("Failed to write to {}: {}", writer_addr, e);
                            lost.signal();
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        // Decode incoming lines and hand them to the session engine
        let lost = ConnectionLost::new(open.clone(), shutdown.clone(), inbound_tx.clone());
        let reader_shutdown = shutdown.clone();
        let reader_addr = addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Ok(message))) => {
                            tracing::debug!("Received: {}", message.to_line());
                            if inbound_tx.send(Inbound::Message(message)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Err(e))) => {
                            if inbound_tx.send(Inbound::Malformed(e)).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Socket error on {}: {}", reader_addr, e);
                            lost.signal();
                            break;
                        }
                        None => {
                            tracing::info!("Connection to {} closed by gateway", reader_addr);
                            lost.signal();
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                addr,
                outbound,
                open,
                shutdown,
            },
            inbound_rx,
        ))
    }

    /// Queue a command for the writer task
    pub fn send(&self, command: Command) -> Result<()> {
        if !self.is_open() {
            return Err(WmpError::ConnectionClosed);
        }
        self.outbound
            .send(command)
            .map_err(|_| WmpError::ConnectionClosed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Close the socket without reporting it as lost
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("Closing connection to {}", self.addr);
        }
        self.shutdown.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Marks the connection down and tells the engine, once
struct ConnectionLost {
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
}

impl ConnectionLost {
    fn new(
        open: Arc<AtomicBool>,
        shutdown: CancellationToken,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            open,
            shutdown,
            inbound_tx,
        }
    }

    fn signal(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.inbound_tx.send(Inbound::Closed);
        }
        self.shutdown.cancel();
    }
}
