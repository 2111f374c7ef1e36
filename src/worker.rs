//! Worker role: register functions, wait for assignments, report results

use crate::config::TlsConfig;
use crate::connection::{self, ConnectionState, FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::pool::{lock, ServerPool, DEFAULT_SERVER_TIMEOUT};
use crate::protocol::{bytes_to_string, Magic, Packet, PacketType, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::tls;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One connection to a server
struct WorkerConn {
    address: String,
    writer: FrameWriter,
    state: Mutex<ConnectionState>,
    /// A GRAB_JOB is outstanding
    grabbing: AtomicBool,
    echo_waiters: Mutex<VecDeque<oneshot::Sender<Bytes>>>,
}

impl WorkerConn {
    fn new(address: String, writer: FrameWriter) -> Self {
        Self {
            address,
            writer,
            state: Mutex::new(ConnectionState::Awake),
            grabbing: AtomicBool::new(false),
            echo_waiters: Mutex::new(VecDeque::new()),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    /// Ask for work unless asleep or already asking
    async fn grab(&self) {
        if self.state() != ConnectionState::Awake || self.grabbing.swap(true, Ordering::SeqCst) {
            return;
        }
        let packet = Packet::request(PacketType::GrabJobUniq, &[]);
        if let Err(e) = self.writer.send_packet(&packet).await {
            debug!("Grab on {} failed: {}", self.address, e);
            self.grabbing.store(false, Ordering::SeqCst);
        }
    }
}

struct WorkerShared {
    client_id: String,
    pool: ServerPool<WorkerConn>,
    /// Registered functions in registration order
    functions: Mutex<Vec<String>>,
    /// Assignments not yet handed to a caller
    jobs: Mutex<VecDeque<WorkerJob>>,
    job_ready: Notify,
    /// Callers blocked in `get_job`
    waiting: AtomicUsize,
    /// Cancelled by `stop_waiting_for_jobs`, then replaced
    interrupt: Mutex<CancellationToken>,
}

impl WorkerShared {
    async fn grab_all(&self) {
        for conn in self.pool.connections() {
            conn.grab().await;
        }
    }

    async fn broadcast(&self, packet: &Packet) -> Result<()> {
        for conn in self.pool.connections() {
            conn.writer.send_packet(packet).await?;
        }
        Ok(())
    }
}

/// Counts a caller in `get_job` for as long as its future lives
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Job executor
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    /// Create a worker that identifies itself as `client_id`
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                client_id: client_id.into(),
                pool: ServerPool::new(),
                functions: Mutex::new(Vec::new()),
                jobs: Mutex::new(VecDeque::new()),
                job_ready: Notify::new(),
                waiting: AtomicUsize::new(0),
                interrupt: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Start connecting to a server; see [`crate::Client::add_server`]
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS material cannot be loaded.
    pub async fn add_server(&self, host: &str, port: u16, tls: Option<TlsConfig>) -> Result<()> {
        let connector = match tls {
            Some(config) => Some(tls::connector(&config).await?),
            None => None,
        };

        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        self.shared.pool.spawn(async move {
            if let Err(e) = run_connection(shared, &host, port, connector).await {
                warn!("Connection to {}:{} ended: {}", host, port, e);
            }
        });
        Ok(())
    }

    /// Wait until a server connection is usable
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if none becomes ready within 30 seconds.
    pub async fn wait_for_server(&self) -> Result<()> {
        self.wait_for_server_timeout(DEFAULT_SERVER_TIMEOUT).await
    }

    /// Wait until a server connection is usable, for at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if none becomes ready in time.
    pub async fn wait_for_server_timeout(&self, timeout: Duration) -> Result<()> {
        self.shared.pool.wait_ready(timeout).await
    }

    /// Declare a function to every connected server.
    ///
    /// Servers reconnected later are told as well. A server that already
    /// holds queued work for `name` wakes this worker straight away.
    ///
    /// # Errors
    ///
    /// Returns an error if sending to a server fails.
    pub async fn register_function(&self, name: &str) -> Result<()> {
        {
            let mut functions = lock(&self.shared.functions);
            if !functions.iter().any(|f| f == name) {
                functions.push(name.to_string());
            }
        }
        debug!("Registering {}", name);
        self.shared
            .broadcast(&Packet::request(PacketType::CanDo, &[name.as_bytes()]))
            .await
    }

    /// Withdraw a function from every connected server
    ///
    /// # Errors
    ///
    /// Returns an error if sending to a server fails.
    pub async fn unregister_function(&self, name: &str) -> Result<()> {
        lock(&self.shared.functions).retain(|f| f != name);
        self.shared
            .broadcast(&Packet::request(PacketType::CantDo, &[name.as_bytes()]))
            .await
    }

    /// Registered functions in registration order
    pub fn functions(&self) -> Vec<String> {
        lock(&self.shared.functions).clone()
    }

    /// Wait for the next assignment from any server.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if [`Worker::stop_waiting_for_jobs`] is called
    /// while waiting.
    pub async fn get_job(&self) -> Result<WorkerJob> {
        let token = lock(&self.shared.interrupt).clone();
        let _waiting = WaitingGuard::new(&self.shared.waiting);
        self.wait_for_job(&token).await
    }

    async fn wait_for_job(&self, token: &CancellationToken) -> Result<WorkerJob> {
        loop {
            let next = lock(&self.shared.jobs).pop_front();
            if let Some(job) = next {
                return Ok(job);
            }

            self.shared.grab_all().await;

            tokio::select! {
                () = token.cancelled() => {
                    debug!("Interrupted while waiting for jobs");
                    return Err(Error::Interrupted);
                }
                () = self.shared.job_ready.notified() => {}
            }
        }
    }

    /// Wake every caller blocked in [`Worker::get_job`] with `Interrupted`.
    ///
    /// Safe to call when nobody is waiting; later calls to `get_job` wait
    /// normally.
    pub fn stop_waiting_for_jobs(&self) {
        let mut token = lock(&self.shared.interrupt);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Round-trip `data` through a server
    ///
    /// # Errors
    ///
    /// Returns `NoServers` without a ready connection, or the connection error.
    pub async fn echo(&self, data: &[u8]) -> Result<Bytes> {
        let conn = self.shared.pool.next()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = conn.writer.lock().await;
            lock(&conn.echo_waiters).push_back(tx);
            let packet = Packet::request(PacketType::EchoReq, &[data]);
            if let Err(e) = connection::write_packet(&mut *writer, &packet).await {
                lock(&conn.echo_waiters).pop_back();
                return Err(e);
            }
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Protocol state of each live server connection
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        self.shared
            .pool
            .connections()
            .iter()
            .map(|conn| conn.state())
            .collect()
    }

    /// Stop waiting and close all server connections
    pub async fn shutdown(&self) {
        self.stop_waiting_for_jobs();
        for conn in self.shared.pool.close() {
            conn.set_state(ConnectionState::Closed);
            conn.writer.shutdown().await;
        }
        info!("Worker {} shut down", self.shared.client_id);
    }
}

async fn run_connection(
    shared: Arc<WorkerShared>,
    host: &str,
    port: u16,
    connector: Option<TlsConnector>,
) -> Result<()> {
    let stream = connection::connect(host, port, connector.as_ref()).await?;
    let (mut reader, writer) = connection::split(stream, DEFAULT_MAX_PAYLOAD_SIZE);

    let conn = Arc::new(WorkerConn::new(format!("{host}:{port}"), writer));

    // Insert before reading the function list so a concurrent registration
    // reaches this connection one way or the other
    shared.pool.insert(Arc::clone(&conn));
    let mut hello = vec![Packet::request(
        PacketType::SetClientId,
        &[shared.client_id.as_bytes()],
    )];
    hello.extend(
        lock(&shared.functions)
            .iter()
            .map(|f| Packet::request(PacketType::CanDo, &[f.as_bytes()])),
    );

    let result = match conn.writer.send_packets(&hello).await {
        Ok(()) => {
            info!("Worker connected to {}", conn.address);
            if shared.waiting.load(Ordering::SeqCst) > 0 {
                conn.grab().await;
            }
            read_loop(&shared, &conn, &mut reader).await
        }
        Err(e) => Err(e),
    };

    conn.set_state(ConnectionState::Closed);
    lock(&conn.echo_waiters).clear();
    shared.pool.remove(&conn);

    match result {
        Err(Error::ConnectionClosed) => {
            info!("Server {} closed the connection", conn.address);
            Ok(())
        }
        other => other,
    }
}

async fn read_loop(
    shared: &WorkerShared,
    conn: &Arc<WorkerConn>,
    reader: &mut FrameReader,
) -> Result<()> {
    loop {
        let packet = reader.read_packet().await?;
        if packet.magic != Magic::Response {
            return Err(Error::Protocol(format!(
                "Expected a response, got a {:?} request",
                packet.ptype
            )));
        }
        debug!("<- {:?} from {}", packet.ptype, conn.address);

        match packet.ptype {
            PacketType::Noop => {
                conn.set_state(ConnectionState::Awake);
                if shared.waiting.load(Ordering::SeqCst) > 0 {
                    conn.grab().await;
                }
            }
            PacketType::NoJob => {
                conn.grabbing.store(false, Ordering::SeqCst);
                conn.set_state(ConnectionState::Sleep);
                conn.writer
                    .send_packet(&Packet::request(PacketType::PreSleep, &[]))
                    .await?;
            }
            PacketType::JobAssign | PacketType::JobAssignUniq => {
                conn.grabbing.store(false, Ordering::SeqCst);
                let job = WorkerJob::from_assignment(&packet, Arc::clone(conn))?;
                info!("Assigned {} ({})", job.handle, job.name);
                // Counted before the notify, while no caller can pop
                let more_wanted = {
                    let mut jobs = lock(&shared.jobs);
                    jobs.push_back(job);
                    shared.waiting.load(Ordering::SeqCst) > jobs.len()
                };
                shared.job_ready.notify_one();
                if more_wanted {
                    conn.grab().await;
                }
            }
            PacketType::EchoRes => {
                let waiter = lock(&conn.echo_waiters).pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(packet.data);
                }
            }
            PacketType::Error => {
                let args = packet.arguments(2)?;
                warn!(
                    "Server {} returned error {}: {}",
                    conn.address,
                    String::from_utf8_lossy(&args[0]),
                    String::from_utf8_lossy(&args[1])
                );
            }
            other => warn!("Unexpected {:?} from {}", other, conn.address),
        }
    }
}

/// An assignment handed to this worker.
///
/// Reports go back over the connection the assignment arrived on. Exactly
/// one terminal report is allowed.
pub struct WorkerJob {
    handle: String,
    name: String,
    unique: Option<String>,
    arguments: Bytes,
    conn: Arc<WorkerConn>,
    finished: AtomicBool,
}

impl WorkerJob {
    fn from_assignment(packet: &Packet, conn: Arc<WorkerConn>) -> Result<Self> {
        let with_unique = packet.ptype == PacketType::JobAssignUniq;
        let args = packet.arguments(if with_unique { 4 } else { 3 })?;
        let unique = if with_unique {
            Some(bytes_to_string(&args[2])?)
        } else {
            None
        };

        Ok(Self {
            handle: bytes_to_string(&args[0])?,
            name: bytes_to_string(&args[1])?,
            unique: unique.filter(|u| !u.is_empty()),
            arguments: args[args.len() - 1].clone(),
            conn,
            finished: AtomicBool::new(false),
        })
    }

    /// Server-assigned handle
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique token supplied by the client, if any
    pub fn unique(&self) -> Option<&str> {
        self.unique.as_deref()
    }

    /// Raw argument payload
    pub fn arguments(&self) -> &Bytes {
        &self.arguments
    }

    /// Argument payload decoded as UTF-8
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload is not valid UTF-8.
    pub fn arguments_text(&self) -> Result<String> {
        bytes_to_string(&self.arguments)
    }

    /// Whether a terminal report was sent
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Send a partial result
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_data(&self, data: &[u8]) -> Result<()> {
        self.send(PacketType::WorkData, &[data]).await
    }

    /// Send a warning
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_warning(&self, data: &[u8]) -> Result<()> {
        self.send(PacketType::WorkWarning, &[data]).await
    }

    /// Report progress as `numerator` out of `denominator`
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        let numerator = numerator.to_string();
        let denominator = denominator.to_string();
        self.send(
            PacketType::WorkStatus,
            &[numerator.as_bytes(), denominator.as_bytes()],
        )
        .await
    }

    /// Finish successfully with a final chunk, which may be empty
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_complete(&self, data: &[u8]) -> Result<()> {
        self.finish(PacketType::WorkComplete, &[data]).await
    }

    /// Finish with a failure
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_fail(&self) -> Result<()> {
        self.finish(PacketType::WorkFail, &[]).await
    }

    /// Finish with a failure carrying a message
    ///
    /// # Errors
    ///
    /// Returns `JobFinished` after a terminal report, or the connection error.
    pub async fn send_work_exception(&self, message: &str) -> Result<()> {
        self.finish(PacketType::WorkException, &[message.as_bytes()])
            .await
    }

    async fn finish(&self, ptype: PacketType, args: &[&[u8]]) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(Error::JobFinished(self.handle.clone()));
        }
        self.write(ptype, args).await
    }

    async fn send(&self, ptype: PacketType, args: &[&[u8]]) -> Result<()> {
        if self.is_finished() {
            return Err(Error::JobFinished(self.handle.clone()));
        }
        self.write(ptype, args).await
    }

    async fn write(&self, ptype: PacketType, args: &[&[u8]]) -> Result<()> {
        if self.conn.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let mut parts: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        parts.push(self.handle.as_bytes());
        parts.extend_from_slice(args);
        self.conn
            .writer
            .send_packet(&Packet::request(ptype, &parts))
            .await
    }
}

impl fmt::Debug for WorkerJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerJob")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("unique", &self.unique)
            .field("arguments", &self.arguments.len())
            .field("server", &self.conn.address)
            .finish_non_exhaustive()
    }
}
