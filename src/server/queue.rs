//! Queue manager: job arena, per-function priority queues and dispatch
//!
//! All state lives behind one server-wide lock. Each method runs to
//! completion under that lock, so "is there work for this newly registered
//! capability" and the matching wake-up happen atomically. Outbound packets
//! are pushed to per-connection channels and written by each connection's
//! writer task.

use crate::error::{Error, Result};
use crate::job::Priority;
use crate::protocol::admin::{FunctionStatus, JobInfo, WorkerInfo};
use crate::protocol::{Frame, Magic, Packet, PacketType};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Server-side connection identifier
pub type ConnectionId = u64;

/// Bounded outbound queue of one connection.
///
/// Frames are queued without waiting. A peer that stops reading fills the
/// queue; the next frame is dropped and `overflow` is cancelled so the
/// connection task can close it.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: Sender<Frame>,
    overflow: CancellationToken,
}

impl Outbox {
    /// Wrap a sender; `overflow` is cancelled when the queue fills
    pub fn new(tx: Sender<Frame>, overflow: CancellationToken) -> Self {
        Self { tx, overflow }
    }

    /// Queue a frame; returns false if it was dropped
    pub fn send(&self, frame: impl Into<Frame>) -> bool {
        match self.tx.try_send(frame.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.overflow.is_cancelled() {
                    warn!("Outbound queue full, disconnecting slow peer");
                    self.overflow.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether a frame has been dropped for lack of room
    pub fn overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }
}

/// A submitted, not yet completed job
#[derive(Debug)]
struct ServerJob {
    handle: String,
    function: String,
    unique: Option<String>,
    arguments: Bytes,
    priority: Priority,
    background: bool,
    /// Foreground submitters still attached
    clients: Vec<ConnectionId>,
    /// Worker holding the job; `None` while queued
    worker: Option<ConnectionId>,
    progress: (u64, u64),
}

/// Per-connection protocol state
#[derive(Debug)]
struct Peer {
    address: String,
    client_id: String,
    /// Capabilities in registration order
    functions: Vec<String>,
    sleeping: bool,
    exceptions: bool,
    outbox: Outbox,
}

/// Pending work per function, one FIFO per priority band
type FunctionQueue = [VecDeque<String>; 3];

/// The broker's scheduling core
pub struct QueueManager {
    handle_prefix: String,
    next_handle: u64,
    /// Arena of outstanding jobs keyed by handle
    jobs: HashMap<String, ServerJob>,
    queues: HashMap<String, FunctionQueue>,
    /// (function, unique) -> handle, for coalescing
    unique: HashMap<(String, String), String>,
    peers: HashMap<ConnectionId, Peer>,
}

impl QueueManager {
    /// Create an empty manager; handles look like `H:<prefix>:<n>`
    pub fn new(handle_prefix: impl Into<String>) -> Self {
        Self {
            handle_prefix: handle_prefix.into(),
            next_handle: 0,
            jobs: HashMap::new(),
            queues: HashMap::new(),
            unique: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    /// Register a new connection and its outbound queue
    pub fn add_peer(&mut self, id: ConnectionId, address: String, outbox: Outbox) {
        self.peers.insert(
            id,
            Peer {
                address,
                client_id: "-".to_string(),
                functions: Vec::new(),
                sleeping: false,
                exceptions: false,
                outbox,
            },
        );
    }

    /// Forget a connection.
    ///
    /// Jobs it submitted lose it as a delivery target. Jobs it was working
    /// on stay in flight; they are not requeued.
    pub fn remove_peer(&mut self, id: ConnectionId) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        for function in &peer.functions {
            self.prune(function);
        }

        for job in self.jobs.values_mut() {
            job.clients.retain(|client| *client != id);
            if job.worker == Some(id) {
                warn!(
                    "Worker connection {} closed while holding job {}",
                    id, job.handle
                );
            }
        }
    }

    /// Record the identifier sent with SET_CLIENT_ID
    pub fn set_client_id(&mut self, id: ConnectionId, client_id: String) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.client_id = client_id;
        }
    }

    /// Apply an OPTION_REQ
    ///
    /// # Errors
    ///
    /// Returns an error for options other than `exceptions`.
    pub fn set_option(&mut self, id: ConnectionId, option: &str) -> Result<()> {
        if option != "exceptions" {
            return Err(Error::InvalidArguments(format!("Unknown option: {option}")));
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.exceptions = true;
            self.send(id, Packet::response(PacketType::OptionRes, &[option.as_bytes()]));
        }
        Ok(())
    }

    /// Accept a submission and answer with JOB_CREATED.
    ///
    /// A job with the same function and unique token that is still queued or
    /// running is reused instead of creating a new one.
    pub fn submit_job(
        &mut self,
        id: ConnectionId,
        function: &str,
        unique: Option<&str>,
        arguments: Bytes,
        priority: Priority,
        background: bool,
    ) -> String {
        let unique = unique.filter(|u| !u.is_empty());

        if let Some(existing) = unique
            .and_then(|u| self.unique.get(&(function.to_string(), u.to_string())))
            .cloned()
        {
            if let Some(job) = self.jobs.get_mut(&existing) {
                if !background && !job.clients.contains(&id) {
                    job.clients.push(id);
                }
                debug!("Coalesced submission for {} onto {}", function, existing);
                self.send(
                    id,
                    Packet::response(PacketType::JobCreated, &[existing.as_bytes()]),
                );
                return existing;
            }
        }

        self.next_handle += 1;
        let handle = format!("H:{}:{}", self.handle_prefix, self.next_handle);

        let job = ServerJob {
            handle: handle.clone(),
            function: function.to_string(),
            unique: unique.map(str::to_string),
            arguments,
            priority,
            background,
            clients: if background { Vec::new() } else { vec![id] },
            worker: None,
            progress: (0, 0),
        };

        if let Some(u) = unique {
            self.unique
                .insert((function.to_string(), u.to_string()), handle.clone());
        }
        self.jobs.insert(handle.clone(), job);
        self.queues.entry(function.to_string()).or_default()[priority.index()]
            .push_back(handle.clone());

        debug!(
            "Queued {} for {} at {} priority (background: {})",
            handle, function, priority, background
        );

        self.send(
            id,
            Packet::response(PacketType::JobCreated, &[handle.as_bytes()]),
        );
        self.wake_workers(function);
        handle
    }

    /// Add a capability; wakes the connection at once if work is pending
    pub fn can_do(&mut self, id: ConnectionId, function: &str) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if !peer.functions.iter().any(|f| f == function) {
            peer.functions.push(function.to_string());
        }
        debug!("Connection {} can do {}", id, function);

        if self.has_work(function) {
            self.wake(id);
        }
    }

    /// Remove a capability
    pub fn cant_do(&mut self, id: ConnectionId, function: &str) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.functions.retain(|f| f != function);
        }
        self.prune(function);
    }

    /// Remove all capabilities
    pub fn reset_abilities(&mut self, id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        for function in std::mem::take(&mut peer.functions) {
            self.prune(&function);
        }
    }

    /// The worker is about to sleep; wake it straight away if work exists
    pub fn pre_sleep(&mut self, id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.sleeping = true;

        let functions = peer.functions.clone();
        if functions.iter().any(|f| self.has_work(f)) {
            self.wake(id);
        } else {
            debug!("Connection {} sleeping", id);
        }
    }

    /// Hand the connection the best queued job, or NO_JOB.
    ///
    /// Picks the highest priority band that has work for any registered
    /// function; within a band, functions are tried in registration order.
    pub fn grab_job(&mut self, id: ConnectionId, with_unique: bool) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.sleeping = false;
        let functions = peer.functions.clone();

        let mut picked = None;
        'bands: for priority in Priority::ALL {
            for function in &functions {
                if let Some(queue) = self.queues.get_mut(function) {
                    if let Some(handle) = queue[priority.index()].pop_front() {
                        picked = Some(handle);
                        break 'bands;
                    }
                }
            }
        }

        let Some(handle) = picked else {
            self.send(id, Packet::response(PacketType::NoJob, &[]));
            return;
        };

        let Some(job) = self.jobs.get_mut(&handle) else {
            warn!("Queue entry {} has no job", handle);
            self.send(id, Packet::response(PacketType::NoJob, &[]));
            return;
        };
        job.worker = Some(id);

        let packet = if with_unique {
            Packet::response(
                PacketType::JobAssignUniq,
                &[
                    job.handle.as_bytes(),
                    job.function.as_bytes(),
                    job.unique.as_deref().unwrap_or("").as_bytes(),
                    &job.arguments[..],
                ],
            )
        } else {
            Packet::response(
                PacketType::JobAssign,
                &[job.handle.as_bytes(), job.function.as_bytes(), &job.arguments[..]],
            )
        };

        info!("Assigned {} ({}) to connection {}", handle, job.function, id);
        self.send(id, packet);
    }

    /// Relay a WORK_* packet from a worker to the job's clients.
    ///
    /// The packet payload starts with the handle. Terminal
    /// packets remove the job, so a second terminal report is rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is unknown or held by another connection.
    pub fn work_update(&mut self, id: ConnectionId, packet: &Packet) -> Result<()> {
        let ptype = packet.ptype;
        let (handle, payload) = packet.handle_and_payload();
        let handle = String::from_utf8_lossy(&handle).into_owned();

        let Some(job) = self.jobs.get_mut(&handle) else {
            return Err(Error::JobFinished(handle));
        };
        if job.worker != Some(id) {
            return Err(Error::InvalidArguments(format!(
                "Job {handle} is not assigned to this connection"
            )));
        }

        if ptype == PacketType::WorkStatus {
            if let Some(progress) = crate::job::parse_progress(&payload) {
                job.progress = progress;
            }
        }

        let terminal = matches!(
            ptype,
            PacketType::WorkComplete | PacketType::WorkFail | PacketType::WorkException
        );
        let clients = job.clients.clone();
        if clients.is_empty() && !job.background {
            debug!("{:?} for {} has no client left to deliver to", ptype, handle);
        }

        for client in clients {
            let wants_exceptions = self.peers.get(&client).is_some_and(|p| p.exceptions);
            let packet = if ptype == PacketType::WorkException && !wants_exceptions {
                Packet::response(PacketType::WorkFail, &[handle.as_bytes()])
            } else {
                Packet::new(Magic::Response, ptype, packet.data.clone())
            };
            self.send(client, packet);
        }

        if terminal {
            self.finish(&handle);
        }
        Ok(())
    }

    /// Answer GET_STATUS
    pub fn get_status(&mut self, id: ConnectionId, handle: &str) {
        let (known, running, (num, den)) = match self.jobs.get(handle) {
            Some(job) => (true, job.worker.is_some(), job.progress),
            None => (false, false, (0, 0)),
        };
        let packet = Packet::response(
            PacketType::StatusRes,
            &[
                handle.as_bytes(),
                flag(known),
                flag(running),
                num.to_string().as_bytes(),
                den.to_string().as_bytes(),
            ],
        );
        self.send(id, packet);
    }

    /// Drop a job that is still queued; running jobs are left alone
    pub fn cancel_job(&mut self, handle: &str) -> bool {
        let Some(job) = self.jobs.get(handle) else {
            return false;
        };
        if job.worker.is_some() {
            return false;
        }

        let function = job.function.clone();
        if let Some(queue) = self.queues.get_mut(&function) {
            queue[job.priority.index()].retain(|h| h != handle);
        }
        self.prune(&function);
        info!("Cancelled queued job {}", handle);
        self.finish(handle);
        true
    }

    /// Rows for the `status` admin command, sorted by function
    pub fn status(&self) -> Vec<FunctionStatus> {
        let mut names: BTreeSet<&str> = self.queues.keys().map(String::as_str).collect();
        names.extend(self.jobs.values().map(|job| job.function.as_str()));
        for peer in self.peers.values() {
            names.extend(peer.functions.iter().map(String::as_str));
        }

        names
            .into_iter()
            .map(|name| {
                let (total, running) = self
                    .jobs
                    .values()
                    .filter(|job| job.function == name)
                    .fold((0, 0), |(total, running), job| {
                        (total + 1, running + usize::from(job.worker.is_some()))
                    });
                let workers = self
                    .peers
                    .values()
                    .filter(|peer| peer.functions.iter().any(|f| f == name))
                    .count();
                FunctionStatus {
                    name: name.to_string(),
                    total,
                    running,
                    workers,
                }
            })
            .collect()
    }

    /// Rows for the `workers` admin command, sorted by connection id
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut rows: Vec<WorkerInfo> = self
            .peers
            .iter()
            .map(|(id, peer)| WorkerInfo {
                connection_id: *id,
                address: peer.address.clone(),
                client_id: peer.client_id.clone(),
                functions: peer.functions.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.connection_id);
        rows
    }

    /// Rows for `show jobs`, sorted by handle
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut rows: Vec<JobInfo> = self
            .jobs
            .values()
            .map(|job| JobInfo {
                handle: job.handle.clone(),
                function: job.function.clone(),
                unique: job.unique.clone(),
                running: job.worker.is_some(),
                clients: job.clients.len(),
            })
            .collect();
        rows.sort_by(|a, b| a.handle.cmp(&b.handle));
        rows
    }

    /// Number of queued (not yet assigned) jobs for `function` in one band
    pub fn queued(&self, function: &str, priority: Priority) -> usize {
        self.queues
            .get(function)
            .map_or(0, |queue| queue[priority.index()].len())
    }

    /// Number of queued jobs across all functions and bands
    pub fn total_queued(&self) -> usize {
        self.queues
            .values()
            .map(|queue| queue.iter().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    /// Number of jobs assigned to a worker
    pub fn in_flight(&self) -> usize {
        self.jobs.values().filter(|job| job.worker.is_some()).count()
    }

    /// Whether the connection is marked sleeping
    pub fn is_sleeping(&self, id: ConnectionId) -> bool {
        self.peers.get(&id).is_some_and(|peer| peer.sleeping)
    }

    fn has_work(&self, function: &str) -> bool {
        self.queues
            .get(function)
            .is_some_and(|queue| queue.iter().any(|band| !band.is_empty()))
    }

    /// NOOP every sleeping connection that can do `function`
    fn wake_workers(&mut self, function: &str) {
        let sleepers: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.sleeping && peer.functions.iter().any(|f| f == function))
            .map(|(id, _)| *id)
            .collect();

        for id in sleepers {
            self.wake(id);
        }
    }

    fn wake(&mut self, id: ConnectionId) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if !peer.sleeping {
            return;
        }
        peer.sleeping = false;
        debug!("Waking connection {}", id);
        self.send(id, Packet::response(PacketType::Noop, &[]));
    }

    fn finish(&mut self, handle: &str) {
        if let Some(job) = self.jobs.remove(handle) {
            if let Some(unique) = job.unique {
                self.unique.remove(&(job.function, unique));
            }
        }
    }

    /// Forget a function's queues once nothing is queued and nobody can do it
    fn prune(&mut self, function: &str) {
        let empty = self
            .queues
            .get(function)
            .is_some_and(|queue| queue.iter().all(VecDeque::is_empty));
        let registered = self
            .peers
            .values()
            .any(|peer| peer.functions.iter().any(|f| f == function));
        if empty && !registered {
            self.queues.remove(function);
        }
    }

    fn send(&self, id: ConnectionId, packet: Packet) {
        match self.peers.get(&id) {
            Some(peer) => {
                let ptype = packet.ptype;
                if !peer.outbox.send(packet) {
                    debug!("Dropped {:?} for connection {}", ptype, id);
                }
            }
            None => debug!("Dropping {:?} for closed connection {}", packet.ptype, id),
        }
    }
}

fn flag(value: bool) -> &'static [u8] {
    if value {
        b"1"
    } else {
        b"0"
    }
}
