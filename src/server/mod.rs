//! TCP server speaking the binary job protocol and the admin text protocol

mod queue;

pub use queue::{ConnectionId, Outbox, QueueManager};

use crate::config::ServerConfig;
use crate::connection::{self, BoxedStream};
use crate::error::{Error, Result};
use crate::job::Priority;
use crate::protocol::admin::{self, AdminCommand};
use crate::protocol::{Frame, Magic, Packet, PacketType};
use crate::tls;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedQueue = Arc<Mutex<QueueManager>>;

/// Job server
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    queue: SharedQueue,
    acceptor: Option<TlsAcceptor>,
}

impl Server {
    /// Create a new server bound to `config.bind_addr`
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the TLS material cannot be loaded.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let acceptor = match &config.tls {
            Some(tls_config) => {
                if !tls_config.is_complete() {
                    warn!("TLS configured without a CA; client certificates are not required");
                }
                Some(tls::acceptor(tls_config).await?)
            }
            None => None,
        };

        let listener = TcpListener::bind(&config.bind_addr).await?;
        info!(
            "gearq server listening on {} (tls: {})",
            listener.local_addr()?,
            acceptor.is_some()
        );

        Ok(Self {
            listener,
            queue: Arc::new(Mutex::new(QueueManager::new(config.handle_prefix.clone()))),
            config,
            acceptor,
        })
    }

    /// Get the local address the server is bound to
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// Shared handle on the scheduling state, for inspection
    pub fn queue_manager(&self) -> Arc<Mutex<QueueManager>> {
        Arc::clone(&self.queue)
    }

    /// Run the server until the process exits
    ///
    /// # Errors
    ///
    /// Never returns an error today; accept failures are logged.
    pub async fn run(self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Run the server until `shutdown` is cancelled.
    ///
    /// Cancelling stops accepting and closes every open connection.
    ///
    /// # Errors
    ///
    /// Never returns an error today; accept failures are logged.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let connections = Arc::new(AtomicUsize::new(0));
        let mut next_id: ConnectionId = 0;

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if connections.load(Ordering::SeqCst) >= self.config.max_connections {
                warn!(
                    "Connection limit reached, rejecting connection from {}",
                    addr
                );
                drop(stream);
                continue;
            }

            next_id += 1;
            let guard = ConnectionGuard::new(Arc::clone(&connections));
            debug!(
                "Accepted connection {} from {}, total: {}",
                next_id,
                addr,
                connections.load(Ordering::SeqCst)
            );

            let ctx = ConnectionContext {
                id: next_id,
                addr,
                queue: Arc::clone(&self.queue),
                acceptor: self.acceptor.clone(),
                max_payload_size: self.config.max_payload_size,
                outbound_queue_size: self.config.outbound_queue_size,
                shutdown: shutdown.child_token(),
            };
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = handle_connection(stream, ctx).await {
                    debug!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Decrements the live connection count when a connection task ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ConnectionContext {
    id: ConnectionId,
    addr: SocketAddr,
    queue: SharedQueue,
    acceptor: Option<TlsAcceptor>,
    max_payload_size: u32,
    outbound_queue_size: usize,
    shutdown: CancellationToken,
}

fn lock(queue: &SharedQueue) -> Result<MutexGuard<'_, QueueManager>> {
    queue
        .lock()
        .map_err(|_| Error::Protocol("Failed to acquire queue lock".to_string()))
}

/// Serve one connection until it closes.
///
/// Outbound frames go through a bounded queue drained by a writer task, so
/// the queue manager never awaits a socket while holding its lock. A peer
/// that lets the queue fill is disconnected.
async fn handle_connection(stream: TcpStream, ctx: ConnectionContext) -> Result<()> {
    stream.set_nodelay(true)?;
    let stream: BoxedStream = match &ctx.acceptor {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    };

    let (mut reader, writer) = connection::split(stream, ctx.max_payload_size);
    let (tx, mut rx) = mpsc::channel::<Frame>(ctx.outbound_queue_size.max(1));
    let overflow = CancellationToken::new();
    let outbox = Outbox::new(tx, overflow.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send_frame(&frame).await {
                debug!("Write failed: {}", e);
                break;
            }
        }
        writer.shutdown().await;
    });

    lock(&ctx.queue)?.add_peer(ctx.id, ctx.addr.to_string(), outbox.clone());

    let result = loop {
        let frame = tokio::select! {
            () = ctx.shutdown.cancelled() => break Ok(()),
            () = overflow.cancelled() => {
                warn!("Connection {} from {} is not reading, closing", ctx.id, ctx.addr);
                break Err(Error::Protocol("Outbound queue full".to_string()));
            }
            frame = reader.read_frame() => frame,
        };

        match frame {
            Ok(Frame::Packet(packet)) => {
                debug!("<- {:?} from {}", packet.ptype, ctx.id);
                if let Err(e) = handle_packet(&ctx.queue, ctx.id, &outbox, packet) {
                    outbox.send(e.to_error_packet());
                    if e.is_fatal() {
                        break Err(e);
                    }
                    debug!("Request from {} rejected: {}", ctx.id, e);
                }
            }
            Ok(Frame::Text(line)) => match handle_admin(&ctx.queue, &line) {
                Ok(response) => {
                    outbox.send(Frame::Text(response));
                }
                Err(e) => break Err(e),
            },
            Err(Error::ConnectionClosed) => {
                debug!("Client {} disconnected", ctx.id);
                break Ok(());
            }
            Err(e) => {
                warn!("Closing connection {} from {}: {}", ctx.id, ctx.addr, e);
                if !matches!(e, Error::Io(_)) {
                    outbox.send(e.to_error_packet());
                }
                break Err(e);
            }
        }
    };

    if let Ok(mut queue) = lock(&ctx.queue) {
        queue.remove_peer(ctx.id);
    }
    if outbox.overflowed() {
        // The writer is stuck on a peer that does not read
        writer_task.abort();
    } else {
        drop(outbox);
        let _ = writer_task.await;
    }
    result
}

/// Handle one binary request
fn handle_packet(
    queue: &SharedQueue,
    id: ConnectionId,
    outbox: &Outbox,
    packet: Packet,
) -> Result<()> {
    if packet.magic != Magic::Request {
        return Err(Error::Protocol(format!(
            "Expected a request, got a {:?} response",
            packet.ptype
        )));
    }

    match packet.ptype {
        PacketType::EchoReq => {
            outbox.send(Packet::new(Magic::Response, PacketType::EchoRes, packet.data));
        }
        PacketType::SetClientId => lock(queue)?.set_client_id(id, packet.text()?),
        PacketType::OptionReq => lock(queue)?.set_option(id, &packet.text()?)?,
        PacketType::CanDo => lock(queue)?.can_do(id, &packet.text()?),
        PacketType::CanDoTimeout => {
            let args = packet.arguments(2)?;
            let function = crate::protocol::bytes_to_string(&args[0])?;
            lock(queue)?.can_do(id, &function);
        }
        PacketType::CantDo => lock(queue)?.cant_do(id, &packet.text()?),
        PacketType::ResetAbilities => lock(queue)?.reset_abilities(id),
        PacketType::PreSleep => lock(queue)?.pre_sleep(id),
        PacketType::GrabJob => lock(queue)?.grab_job(id, false),
        PacketType::GrabJobUniq => lock(queue)?.grab_job(id, true),
        PacketType::GetStatus => lock(queue)?.get_status(id, &packet.text()?),
        PacketType::WorkData
        | PacketType::WorkWarning
        | PacketType::WorkStatus
        | PacketType::WorkComplete
        | PacketType::WorkFail
        | PacketType::WorkException => lock(queue)?.work_update(id, &packet)?,
        PacketType::AllYours => debug!("Ignoring ALL_YOURS from {}", id),
        ptype => match Priority::from_submit_packet(ptype) {
            Some((priority, background)) => {
                let args = packet.arguments(3)?;
                let function = crate::protocol::bytes_to_string(&args[0])?;
                let unique = crate::protocol::bytes_to_string(&args[1])?;
                if function.is_empty() {
                    return Err(Error::InvalidArguments(
                        "Function name must not be empty".to_string(),
                    ));
                }
                lock(queue)?.submit_job(
                    id,
                    &function,
                    Some(unique.as_str()),
                    args[2].clone(),
                    priority,
                    background,
                );
            }
            None => {
                return Err(Error::InvalidArguments(format!(
                    "Unexpected request type {ptype:?}"
                )))
            }
        },
    }

    Ok(())
}

/// Handle one admin line and render its response
fn handle_admin(queue: &SharedQueue, line: &str) -> Result<String> {
    let command = AdminCommand::parse(line);
    debug!("Admin command {:?}", command);

    let response = match command {
        AdminCommand::Status => admin::format_status(&lock(queue)?.status()),
        AdminCommand::Workers => admin::format_workers(&lock(queue)?.workers()),
        AdminCommand::Version => format!("OK {}\n", env!("CARGO_PKG_VERSION")),
        AdminCommand::ShowJobs => admin::format_jobs(&lock(queue)?.jobs()),
        AdminCommand::ShowUniqueJobs => admin::format_unique_jobs(&lock(queue)?.jobs()),
        AdminCommand::CancelJob(handle) => {
            if lock(queue)?.cancel_job(&handle) {
                "OK\n".to_string()
            } else {
                "ERR UNKNOWN_JOB Job+not+queued\n".to_string()
            }
        }
        AdminCommand::Unknown(_) => admin::unknown_command(),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SharedQueue, Outbox, mpsc::Receiver<Frame>) {
        let queue = Arc::new(Mutex::new(QueueManager::new("test")));
        let (tx, rx) = mpsc::channel(16);
        let outbox = Outbox::new(tx, CancellationToken::new());
        queue
            .lock()
            .unwrap()
            .add_peer(1, "127.0.0.1:1".to_string(), outbox.clone());
        (queue, outbox, rx)
    }

    #[test]
    fn test_echo() {
        let (queue, outbox, mut rx) = setup();
        let packet = Packet::request(PacketType::EchoReq, &[b"hello"]);
        handle_packet(&queue, 1, &outbox, packet).unwrap();

        let Frame::Packet(reply) = rx.try_recv().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(reply.ptype, PacketType::EchoRes);
        assert_eq!(reply.data, &b"hello"[..]);
    }

    #[test]
    fn test_response_magic_rejected() {
        let (queue, outbox, _rx) = setup();
        let packet = Packet::response(PacketType::CanDo, &[b"f"]);
        let err = handle_packet(&queue, 1, &outbox, packet).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unexpected_request_is_not_fatal() {
        let (queue, outbox, _rx) = setup();
        let packet = Packet::request(PacketType::JobCreated, &[b"H:x:1"]);
        let err = handle_packet(&queue, 1, &outbox, packet).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_submit_via_packet() {
        let (queue, outbox, mut rx) = setup();
        let packet = Packet::request(PacketType::SubmitJobLowBg, &[b"resize", b"", b"img"]);
        handle_packet(&queue, 1, &outbox, packet).unwrap();

        let Frame::Packet(reply) = rx.try_recv().unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(reply.ptype, PacketType::JobCreated);
        assert_eq!(queue.lock().unwrap().queued("resize", Priority::Low), 1);

        let admin = handle_admin(&queue, "status").unwrap();
        assert_eq!(admin, "resize\t1\t0\t0\n.\n");
    }

    #[test]
    fn test_admin_unknown_and_version() {
        let (queue, _outbox, _rx) = setup();
        assert_eq!(
            handle_admin(&queue, "bogus").unwrap(),
            "ERR UNKNOWN_COMMAND Unknown+server+command\n"
        );
        assert!(handle_admin(&queue, "version").unwrap().starts_with("OK "));
        assert!(handle_admin(&queue, "cancel job H:test:1")
            .unwrap()
            .starts_with("ERR"));
    }
}
