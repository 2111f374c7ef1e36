//! Outbound server connections shared by clients and workers

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long `wait_for_server` waits by default
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ready connections plus the tasks that own their read halves
pub(crate) struct ServerPool<C> {
    connections: Mutex<Vec<Arc<C>>>,
    ready: watch::Sender<usize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl<C> ServerPool<C> {
    pub(crate) fn new() -> Self {
        let (ready, _) = watch::channel(0);
        Self {
            connections: Mutex::new(Vec::new()),
            ready,
            tasks: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    /// Mark a connection usable
    pub(crate) fn insert(&self, conn: Arc<C>) {
        let mut connections = lock(&self.connections);
        connections.push(conn);
        self.ready.send_replace(connections.len());
    }

    /// Drop a connection that closed
    pub(crate) fn remove(&self, conn: &Arc<C>) {
        let mut connections = lock(&self.connections);
        connections.retain(|c| !Arc::ptr_eq(c, conn));
        self.ready.send_replace(connections.len());
    }

    pub(crate) fn connections(&self) -> Vec<Arc<C>> {
        lock(&self.connections).clone()
    }

    /// Pick a ready connection, rotating between them
    pub(crate) fn next(&self) -> Result<Arc<C>> {
        let connections = lock(&self.connections);
        if connections.is_empty() {
            return Err(Error::NoServers);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(Arc::clone(&connections[i]))
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Wait until at least one connection is ready
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let ready = tokio::time::timeout(timeout, async move {
            rx.wait_for(|count| *count > 0).await.is_ok()
        })
        .await
        .map_err(|_| Error::Timeout)?;

        if ready {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Stop every connection task and forget all connections
    pub(crate) fn close(&self) -> Vec<Arc<C>> {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let closed = std::mem::take(&mut *lock(&self.connections));
        self.ready.send_replace(0);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_times_out_when_empty() {
        let pool: ServerPool<u8> = ServerPool::new();
        let result = pool.wait_ready(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(matches!(pool.next(), Err(Error::NoServers)));
    }

    #[tokio::test]
    async fn test_insert_wakes_waiter() {
        let pool: Arc<ServerPool<u8>> = Arc::new(ServerPool::new());
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_ready(Duration::from_secs(5)).await })
        };

        pool.insert(Arc::new(1));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_next_rotates_and_remove() {
        let pool: ServerPool<u8> = ServerPool::new();
        let a = Arc::new(1);
        let b = Arc::new(2);
        pool.insert(Arc::clone(&a));
        pool.insert(Arc::clone(&b));

        let first = pool.next().unwrap();
        let second = pool.next().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        pool.remove(&a);
        assert_eq!(*pool.next().unwrap(), 2);
        assert_eq!(pool.close().len(), 1);
        assert!(pool.connections().is_empty());
    }
}
