//! End-to-end tests: client -> server -> worker -> client
//!
//! Each test starts its own server on an ephemeral port and talks to it
//! through the library's client and worker.

use bytes::Bytes;
use gearq::server::QueueManager;
use gearq::{Client, ConnectionState, Error, Job, Priority, Server, ServerConfig, Worker};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

/// Helper to start a server on a random port
async fn start_server() -> (u16, Arc<Mutex<QueueManager>>) {
    let server = Server::new(ServerConfig::new("127.0.0.1:0"))
        .await
        .expect("Failed to create server");
    let port = server.local_addr().expect("Failed to get local addr").port();
    let queue = server.queue_manager();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (port, queue)
}

async fn connected_client(port: u16) -> Client {
    let client = Client::new("client");
    client.add_server("127.0.0.1", port, None).await.unwrap();
    client.wait_for_server().await.expect("client never connected");
    client
}

async fn connected_worker(port: u16) -> Worker {
    let worker = Worker::new("worker");
    worker.add_server("127.0.0.1", port, None).await.unwrap();
    worker.wait_for_server().await.expect("worker never connected");
    worker
}

/// Poll `check` until it holds or the wait runs out
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let result = timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timeout waiting for {what}");
}

#[tokio::test]
async fn test_job() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    for _ in 0..2 {
        let job = Job::new("test", "testdata");
        client.submit_job(&job, false).await.unwrap();
        assert!(job.handle().is_some());

        let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
        assert_eq!(worker_job.name(), "test");
        assert_eq!(worker_job.arguments(), &Bytes::from("testdata"));
        assert_eq!(Some(worker_job.handle().to_string()), job.handle());

        worker_job.send_work_data(b"workdata").await.unwrap();
        worker_job.send_work_complete(b"").await.unwrap();

        timeout(WAIT, job.wait_complete()).await.unwrap();
        assert!(job.complete());
        assert!(!job.failed());
        assert_eq!(job.data(), vec![Bytes::from("workdata")]);
    }
}

#[tokio::test]
async fn test_resubmit_is_rejected() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;

    let job = Job::new("test", "testdata");
    client.submit_job(&job, true).await.unwrap();
    let result = client.submit_job(&job, true).await;
    assert!(matches!(result, Err(Error::AlreadySubmitted)));
}

#[tokio::test]
async fn test_bg_job() {
    let (port, queue) = start_server().await;
    let client = connected_client(port).await;

    let job = Job::new("test", "testdata");
    client.submit_job(&job, true).await.unwrap();
    assert!(job.handle().is_some());
    client.shutdown().await;

    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    assert_eq!(worker_job.name(), "test");
    assert_eq!(worker_job.arguments_text().unwrap(), "testdata");
    worker_job.send_work_data(b"workdata").await.unwrap();
    worker_job.send_work_complete(b"").await.unwrap();

    wait_until("job to finish", || queue.lock().unwrap().jobs().is_empty()).await;
}

#[tokio::test]
async fn test_worker_termination() {
    let (port, _queue) = start_server().await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.get_job().await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop_waiting_for_jobs();

    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
}

#[tokio::test]
async fn test_text_job_name() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let job = Job::text("test", "testdata");
    client.submit_job(&job, false).await.unwrap();

    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    assert_eq!(worker_job.name(), "test");
    assert_eq!(worker_job.arguments_text().unwrap(), "testdata");
    worker_job.send_work_data("workdata".as_bytes()).await.unwrap();
    worker_job.send_work_complete(b"").await.unwrap();

    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert_eq!(job.data_text().unwrap(), vec!["workdata".to_string()]);
}

#[tokio::test]
async fn test_text_job_unique() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let unique = uuid::Uuid::new_v4().to_string();
    let job = Job::with_unique("test", "testdata", unique.as_str());
    client.submit_job(&job, false).await.unwrap();

    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    assert_eq!(worker_job.unique(), Some(unique.as_str()));
    worker_job.send_work_complete(b"done").await.unwrap();

    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert_eq!(job.data(), vec![Bytes::from("done")]);
}

#[tokio::test]
async fn test_text_job_exception() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let job = Job::text("test", "testdata");
    client.submit_job(&job, false).await.unwrap();

    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    worker_job.send_work_exception("work failed").await.unwrap();
    assert!(matches!(
        worker_job.send_work_complete(b"").await,
        Err(Error::JobFinished(_))
    ));

    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert_eq!(job.exception().as_deref(), Some("work failed"));
}

#[tokio::test]
async fn test_work_fail() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let job = Job::new("test", "testdata");
    client.submit_job(&job, false).await.unwrap();

    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    worker_job.send_work_fail().await.unwrap();

    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert!(job.failed());
    assert!(job.data().is_empty());
}

#[tokio::test]
async fn test_grab_job_after_register() {
    let (port, queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;

    let job = Job::new("test", "testdata");
    client.submit_job(&job, false).await.unwrap();

    // No functions yet: the worker asks, hears NO_JOB and goes to sleep
    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.get_job().await })
    };
    wait_until("worker to sleep", || {
        worker.connection_states() == vec![ConnectionState::Sleep]
    })
    .await;
    assert_eq!(queue.lock().unwrap().total_queued(), 1);

    // Registering must wake the sleeping worker for the queued job
    worker.register_function("test").await.unwrap();
    let worker_job = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(worker_job.name(), "test");
    worker_job.send_work_complete(b"").await.unwrap();

    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert_eq!(queue.lock().unwrap().total_queued(), 0);
}

#[tokio::test]
async fn test_priority_order() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;

    for (payload, priority) in [
        ("low", Priority::Low),
        ("normal-1", Priority::Normal),
        ("high", Priority::High),
        ("normal-2", Priority::Normal),
    ] {
        let job = Job::new("test", payload);
        client
            .submit_job_with_priority(&job, priority, true)
            .await
            .unwrap();
    }

    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
        order.push(worker_job.arguments_text().unwrap());
        worker_job.send_work_complete(b"").await.unwrap();
    }
    assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
}

#[tokio::test]
async fn test_unique_jobs_coalesce() {
    let (port, queue) = start_server().await;
    let first_client = connected_client(port).await;
    let second_client = connected_client(port).await;

    let first = Job::with_unique("test", "testdata", "shared");
    let second = Job::with_unique("test", "testdata", "shared");
    first_client.submit_job(&first, false).await.unwrap();
    second_client.submit_job(&second, false).await.unwrap();
    assert_eq!(first.handle(), second.handle());
    assert_eq!(queue.lock().unwrap().total_queued(), 1);

    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();
    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    worker_job.send_work_complete(b"result").await.unwrap();

    timeout(WAIT, first.wait_complete()).await.unwrap();
    timeout(WAIT, second.wait_complete()).await.unwrap();
    assert_eq!(first.data(), vec![Bytes::from("result")]);
    assert_eq!(second.data(), vec![Bytes::from("result")]);
}

#[tokio::test]
async fn test_status_and_echo() {
    let (port, _queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    assert_eq!(client.echo(b"ping").await.unwrap(), Bytes::from("ping"));
    assert_eq!(worker.echo(b"pong").await.unwrap(), Bytes::from("pong"));

    let job = Job::new("test", "testdata");
    client.submit_job(&job, false).await.unwrap();
    let worker_job = timeout(WAIT, worker.get_job()).await.unwrap().unwrap();
    worker_job.send_work_status(1, 2).await.unwrap();
    worker_job.send_work_warning(b"slow").await.unwrap();

    wait_until("progress to arrive", || job.state().progress == Some((1, 2))).await;
    let status = client.get_status(&job).await.unwrap();
    assert!(status.known);
    assert!(status.running);
    assert_eq!((status.numerator, status.denominator), (1, 2));

    worker_job.send_work_complete(b"").await.unwrap();
    timeout(WAIT, job.wait_complete()).await.unwrap();
    assert_eq!(job.state().warnings, vec![Bytes::from("slow")]);

    let status = client.get_status(&job).await.unwrap();
    assert!(!status.known);
}

#[tokio::test]
async fn test_unregistered_function_not_dispatched() {
    let (port, queue) = start_server().await;
    let client = connected_client(port).await;
    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();
    worker.unregister_function("test").await.unwrap();

    let job = Job::new("test", "testdata");
    client.submit_job(&job, true).await.unwrap();

    let result = timeout(Duration::from_millis(300), worker.get_job()).await;
    assert!(result.is_err(), "job must not be dispatched");
    assert_eq!(queue.lock().unwrap().total_queued(), 1);
}

#[tokio::test]
async fn test_concurrent_get_job_callers() {
    let (port, queue) = start_server().await;
    let client = connected_client(port).await;

    for payload in ["first", "second"] {
        client
            .submit_job(&Job::new("test", payload), true)
            .await
            .unwrap();
    }

    let worker = connected_worker(port).await;
    worker.register_function("test").await.unwrap();

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.get_job().await })
        })
        .collect();

    let mut received = Vec::new();
    for caller in callers {
        let worker_job = timeout(WAIT, caller).await.unwrap().unwrap().unwrap();
        received.push(worker_job.arguments_text().unwrap());
        worker_job.send_work_complete(b"").await.unwrap();
    }
    received.sort();
    assert_eq!(received, vec!["first", "second"]);

    wait_until("jobs to finish", || queue.lock().unwrap().jobs().is_empty()).await;
}
