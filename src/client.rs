//! Client role: submit jobs and follow their progress.
//!
//! Each server connection gets a reader task. Submissions on one connection
//! are answered in order, so handle assignments are matched to the
//! submissions waiting on that connection first in, first out.

use crate::config::TlsConfig;
use crate::connection::{self, FrameReader, FrameWriter};
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus, Priority};
use crate::pool::{lock, ServerPool, DEFAULT_SERVER_TIMEOUT};
use crate::protocol::{bytes_to_string, Magic, Packet, PacketType, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::tls;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// A submission waiting for JOB_CREATED
struct PendingSubmit {
    job: Job,
    background: bool,
    reply: oneshot::Sender<Result<String>>,
}

/// One connection to a server
struct ServerConn {
    address: String,
    writer: FrameWriter,
    pending: Mutex<VecDeque<PendingSubmit>>,
    /// Foreground jobs by handle; coalesced submissions share a handle
    tracked: Mutex<HashMap<String, Vec<Job>>>,
    status_waiters: Mutex<VecDeque<oneshot::Sender<JobStatus>>>,
    echo_waiters: Mutex<VecDeque<oneshot::Sender<Bytes>>>,
}

impl ServerConn {
    fn new(address: String, writer: FrameWriter) -> Self {
        Self {
            address,
            writer,
            pending: Mutex::new(VecDeque::new()),
            tracked: Mutex::new(HashMap::new()),
            status_waiters: Mutex::new(VecDeque::new()),
            echo_waiters: Mutex::new(VecDeque::new()),
        }
    }

    fn tracks(&self, handle: &str) -> bool {
        lock(&self.tracked).contains_key(handle)
    }

    fn job_created(&self, handle: String) {
        let Some(pending) = lock(&self.pending).pop_front() else {
            warn!("JOB_CREATED {} from {} with no pending submission", handle, self.address);
            return;
        };

        pending.job.set_handle(handle.clone());
        if !pending.background {
            lock(&self.tracked)
                .entry(handle.clone())
                .or_default()
                .push(pending.job);
        }
        let _ = pending.reply.send(Ok(handle));
    }

    fn work_update(&self, packet: &Packet) {
        let (handle, payload) = packet.handle_and_payload();
        let handle = String::from_utf8_lossy(&handle).into_owned();

        let mut tracked = lock(&self.tracked);
        let Some(jobs) = tracked.get(&handle) else {
            debug!("{:?} for untracked job {}", packet.ptype, handle);
            return;
        };

        let mut terminal = false;
        for job in jobs {
            terminal |= job.apply_work(packet.ptype, payload.clone());
        }
        if terminal {
            tracked.remove(&handle);
        }
    }

    fn status_res(&self, packet: &Packet) -> Result<()> {
        let args = packet.arguments(5)?;
        let number = |arg: &Bytes| bytes_to_string(arg).map(|s| s.parse::<u64>().unwrap_or(0));
        let status = JobStatus {
            known: args[1][..] == b"1"[..],
            running: args[2][..] == b"1"[..],
            numerator: number(&args[3])?,
            denominator: number(&args[4])?,
        };
        if let Some(waiter) = lock(&self.status_waiters).pop_front() {
            let _ = waiter.send(status);
        }
        Ok(())
    }

    fn server_error(&self, packet: &Packet) -> Result<()> {
        let args = packet.arguments(2)?;
        let code = String::from_utf8_lossy(&args[0]).into_owned();
        let message = String::from_utf8_lossy(&args[1]).into_owned();
        warn!("Server {} returned error {}: {}", self.address, code, message);

        if let Some(pending) = lock(&self.pending).pop_front() {
            let _ = pending.reply.send(Err(Error::Server { code, message }));
        }
        Ok(())
    }

    /// Fail everything still waiting on this connection
    fn abandon(&self) {
        let dropped = lock(&self.pending).len();
        lock(&self.pending).clear();
        lock(&self.status_waiters).clear();
        lock(&self.echo_waiters).clear();
        let orphaned = lock(&self.tracked).len();
        if dropped > 0 || orphaned > 0 {
            warn!(
                "Connection to {} lost with {} pending submissions and {} unfinished jobs",
                self.address, dropped, orphaned
            );
        }
    }
}

/// Job submitter
#[derive(Clone)]
pub struct Client {
    client_id: String,
    pool: Arc<ServerPool<ServerConn>>,
}

impl Client {
    /// Create a client that identifies itself as `client_id`
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            pool: Arc::new(ServerPool::new()),
        }
    }

    /// Identifier sent with SET_CLIENT_ID
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Start connecting to a server.
    ///
    /// Returns once the TLS material is loaded; the connection is made in
    /// the background. Use [`Client::wait_for_server`] to wait for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS material cannot be loaded.
    pub async fn add_server(&self, host: &str, port: u16, tls: Option<TlsConfig>) -> Result<()> {
        let connector = match tls {
            Some(config) => Some(tls::connector(&config).await?),
            None => None,
        };

        let pool = Arc::clone(&self.pool);
        let client_id = self.client_id.clone();
        let host = host.to_string();
        self.pool.spawn(async move {
            if let Err(e) = run_connection(pool, client_id, &host, port, connector).await {
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
        self.pool.wait_ready(timeout).await
    }

    /// Submit a job at normal priority and wait for its handle.
    ///
    /// Foreground jobs are then updated as the worker reports progress.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubmitted` for a job that was submitted before,
    /// `NoServers` without a ready connection, or the connection error.
    pub async fn submit_job(&self, job: &Job, background: bool) -> Result<()> {
        self.submit_job_with_priority(job, Priority::Normal, background)
            .await
    }

    /// Submit a job at the given priority and wait for its handle
    ///
    /// # Errors
    ///
    /// As [`Client::submit_job`].
    pub async fn submit_job_with_priority(
        &self,
        job: &Job,
        priority: Priority,
        background: bool,
    ) -> Result<()> {
        job.mark_submitted()?;

        match self.send_submission(job, priority, background).await {
            Ok(handle) => {
                debug!("Submitted {} as {}", job.name(), handle);
                Ok(())
            }
            Err(e) => {
                job.clear_submitted();
                Err(e)
            }
        }
    }

    async fn send_submission(
        &self,
        job: &Job,
        priority: Priority,
        background: bool,
    ) -> Result<String> {
        let conn = self.pool.next()?;
        let packet = Packet::request(
            priority.submit_packet(background),
            &[
                job.name().as_bytes(),
                job.unique().unwrap_or_default().as_bytes(),
                &job.arguments()[..],
            ],
        );

        let (reply, rx) = oneshot::channel();
        {
            // Queue and write under the write lock so pending order matches wire order
            let mut writer = conn.writer.lock().await;
            lock(&conn.pending).push_back(PendingSubmit {
                job: job.clone(),
                background,
                reply,
            });
            if let Err(e) = connection::write_packet(&mut *writer, &packet).await {
                lock(&conn.pending).pop_back();
                return Err(e);
            }
        }

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Ask the server for a job's status
    ///
    /// Foreground jobs are asked of the server that created them; other
    /// handles go to any ready server.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for a job without a handle, or the
    /// connection error.
    pub async fn get_status(&self, job: &Job) -> Result<JobStatus> {
        let handle = job
            .handle()
            .ok_or_else(|| Error::InvalidArguments("Job has not been submitted".to_string()))?;

        let conn = match self
            .pool
            .connections()
            .into_iter()
            .find(|conn| conn.tracks(&handle))
        {
            Some(conn) => conn,
            None => self.pool.next()?,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut writer = conn.writer.lock().await;
            lock(&conn.status_waiters).push_back(tx);
            let packet = Packet::request(PacketType::GetStatus, &[handle.as_bytes()]);
            if let Err(e) = connection::write_packet(&mut *writer, &packet).await {
                lock(&conn.status_waiters).pop_back();
                return Err(e);
            }
        }
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Round-trip `data` through a server
    ///
    /// # Errors
    ///
    /// Returns `NoServers` without a ready connection, or the connection error.
    pub async fn echo(&self, data: &[u8]) -> Result<Bytes> {
        let conn = self.pool.next()?;
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

    /// Close all server connections.
    ///
    /// Foreground jobs still outstanding will never complete.
    pub async fn shutdown(&self) {
        for conn in self.pool.close() {
            conn.writer.shutdown().await;
            conn.abandon();
        }
        info!("Client {} shut down", self.client_id);
    }
}

async fn run_connection(
    pool: Arc<ServerPool<ServerConn>>,
    client_id: String,
    host: &str,
    port: u16,
    connector: Option<TlsConnector>,
) -> Result<()> {
    let stream = connection::connect(host, port, connector.as_ref()).await?;
    let (mut reader, writer) = connection::split(stream, DEFAULT_MAX_PAYLOAD_SIZE);

    writer
        .send_packets(&[
            Packet::request(PacketType::SetClientId, &[client_id.as_bytes()]),
            Packet::request(PacketType::OptionReq, &[b"exceptions"]),
        ])
        .await?;

    let conn = Arc::new(ServerConn::new(format!("{host}:{port}"), writer));
    pool.insert(Arc::clone(&conn));
    info!("Client connected to {}", conn.address);

    let result = read_loop(&conn, &mut reader).await;
    pool.remove(&conn);
    conn.abandon();

    match result {
        Err(Error::ConnectionClosed) => {
            info!("Server {} closed the connection", conn.address);
            Ok(())
        }
        other => other,
    }
}

async fn read_loop(conn: &ServerConn, reader: &mut FrameReader) -> Result<()> {
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
            PacketType::JobCreated => conn.job_created(packet.text()?),
            PacketType::WorkData
            | PacketType::WorkWarning
            | PacketType::WorkStatus
            | PacketType::WorkComplete
            | PacketType::WorkFail
            | PacketType::WorkException => conn.work_update(&packet),
            PacketType::StatusRes => conn.status_res(&packet)?,
            PacketType::EchoRes => {
                let waiter = lock(&conn.echo_waiters).pop_front();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(packet.data);
                }
            }
            PacketType::Error => conn.server_error(&packet)?,
            PacketType::OptionRes => debug!("Server {} accepted option", conn.address),
            other => warn!("Unexpected {:?} from {}", other, conn.address),
        }
    }
}
