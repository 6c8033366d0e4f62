use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rq_common::Message;
use rq_queue::{handler_for, InMemoryBroker, MessageHandler, Queue, QueuePublisher};
use rq_router::Pool;

fn recording_handler(
    name: &'static str,
    queue: &'static str,
    seen: Arc<Mutex<Vec<(&'static str, String)>>>,
) -> Arc<dyn MessageHandler> {
    handler_for(name, move |msg| {
        let seen = seen.clone();
        async move {
            seen.lock().push((queue, msg.name.clone()));
            Ok::<(), anyhow::Error>(())
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_fan_out_each_queue_handles_its_own_message() {
    let broker = Arc::new(InMemoryBroker::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let routes = [("orders", "order_created"), ("payments", "payment_captured"), ("audit", "entry_written")];
    let mut queues = Vec::new();
    for (queue, message) in routes {
        queues.push(
            Queue::new(queue, vec![recording_handler(message, queue, seen.clone())], broker.clone())
                .await
                .unwrap()
                .with_poll_interval(Duration::from_millis(5)),
        );
    }
    let pool = Arc::new(Pool::with_queues(queues).unwrap());
    let handle = pool.clone().start();

    for (queue, message) in routes {
        pool.dispatch(queue, &Message::from_bytes(message, b"{}".to_vec()))
            .await
            .unwrap();
    }

    wait_until(|| seen.lock().len() == routes.len()).await;
    assert!(handle.shutdown(Duration::from_secs(5)).await);

    let mut seen = seen.lock().clone();
    seen.sort();
    let mut expected: Vec<_> = routes.iter().map(|(q, m)| (*q, m.to_string())).collect();
    expected.sort();
    assert_eq!(seen, expected);

    for (queue, _) in routes {
        let stats = broker.stats(queue);
        assert_eq!(stats.acked, 1, "queue {queue}");
        assert_eq!(stats.ready, 0, "queue {queue}");
    }
}

#[tokio::test]
async fn test_pool_is_a_queue_publisher() {
    let broker = InMemoryBroker::new();
    let pool = Pool::with_queues([Queue::new("orders", Vec::new(), Arc::new(broker.clone()))
        .await
        .unwrap()])
    .unwrap();

    let publisher: Arc<dyn QueuePublisher> = Arc::new(pool);
    publisher
        .dispatch("orders", &Message::from_bytes("created", Vec::new()))
        .await
        .unwrap();
    assert!(publisher
        .dispatch("missing", &Message::from_bytes("created", Vec::new()))
        .await
        .is_err());

    assert_eq!(broker.stats("orders").published, 1);
}

#[tokio::test]
async fn test_multiple_workers_per_queue() {
    let broker = Arc::new(InMemoryBroker::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let queue = Queue::new(
        "orders",
        vec![handler_for("created", move |_msg| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })],
        broker.clone(),
    )
    .await
    .unwrap()
    .with_poll_interval(Duration::from_millis(5))
    .with_workers(4);

    let pool = Arc::new(Pool::with_queues([queue]).unwrap());
    let handle = pool.clone().start();

    for _ in 0..8 {
        pool.dispatch("orders", &Message::from_bytes("created", Vec::new()))
            .await
            .unwrap();
    }

    wait_until(|| calls.load(Ordering::SeqCst) == 8).await;
    assert!(handle.shutdown(Duration::from_secs(5)).await);
    assert_eq!(broker.stats("orders").acked, 8);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let broker = Arc::new(InMemoryBroker::new());
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let (s, f) = (started.clone(), finished.clone());

    let queue = Queue::new(
        "orders",
        vec![handler_for("slow", move |_msg| {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })],
        broker.clone(),
    )
    .await
    .unwrap()
    .with_poll_interval(Duration::from_millis(5));

    let pool = Arc::new(Pool::with_queues([queue]).unwrap());
    let handle = pool.clone().start();
    pool.dispatch("orders", &Message::from_bytes("slow", Vec::new()))
        .await
        .unwrap();

    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    assert!(handle.shutdown(Duration::from_secs(5)).await);

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stats("orders").acked, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_aborts_stuck_workers() {
    let broker = Arc::new(InMemoryBroker::new());
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();

    let queue = Queue::new(
        "orders",
        vec![handler_for("stuck", move |_msg| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), anyhow::Error>(())
            }
        })],
        broker.clone(),
    )
    .await
    .unwrap();

    let pool = Arc::new(Pool::with_queues([queue]).unwrap());
    let handle = pool.clone().start();
    pool.dispatch("orders", &Message::from_bytes("stuck", Vec::new()))
        .await
        .unwrap();

    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    assert!(!handle.shutdown(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_work_returns_after_shutdown() {
    let broker = Arc::new(InMemoryBroker::new());
    let pool = Arc::new(
        Pool::with_queues([
            Queue::new("orders", Vec::new(), broker.clone()).await.unwrap(),
            Queue::new("payments", Vec::new(), broker.clone()).await.unwrap(),
        ])
        .unwrap(),
    );

    let worker = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.work().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown();

    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .expect("pool did not stop")
        .unwrap();
}
