//! Dispatcher integration tests
//!
//! Drives the public API end to end with the background worker running
//! against a scripted mock transport.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relayq::config::Config;
use relayq::domain::{MAX_RETRIES, Priority};
use relayq::scheduler::{DispatchState, Dispatcher, DispatcherConfig, RateLimitConfig};
use relayq::transport::{MockOutcome, MockTransport};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_tick_interval(Duration::from_millis(10))
        .with_rate_limit(
            RateLimitConfig::new(Duration::from_millis(20), 50)
                .with_backoff(Duration::from_millis(5), Duration::from_millis(40)),
        )
}

fn channel() -> Arc<String> {
    Arc::new("bridge-chat".to_string())
}

/// Poll `condition` until it holds or `timeout` passes.
async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_high_priority_dispatched_before_low() {
    let dispatcher = Dispatcher::new(MockTransport::new(), fast_config());
    dispatcher.start().unwrap();
    dispatcher.pause();

    let order = Arc::new(Mutex::new(Vec::new()));
    for (text, priority) in [("low", Priority::Low), ("high", Priority::High)] {
        let order = order.clone();
        dispatcher.enqueue_with_callback(text.to_string(), channel(), priority, move |ok| {
            assert!(ok);
            order.lock().unwrap().push(text);
        });
    }
    dispatcher.resume();

    assert!(wait_until(WAIT, || order.lock().unwrap().len() == 2).await);
    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    assert_eq!(dispatcher.transport().delivered_payloads(), vec!["high", "low"]);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_always_failing_message_is_attempted_max_retries_plus_one() {
    let transport = MockTransport::always(MockOutcome::Transient("socket closed".to_string()));
    let dispatcher = Dispatcher::new(transport, fast_config());
    dispatcher.start().unwrap();

    let rx = dispatcher.enqueue_tracked("doomed".to_string(), channel(), Priority::Normal);
    let outcome = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();

    assert!(!outcome);
    assert_eq!(dispatcher.transport().attempts_for("doomed"), MAX_RETRIES as usize + 1);
    assert_eq!(dispatcher.stats().failed, 1);
    assert_eq!(dispatcher.queue_size(), 0);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_enqueue_on_stopped_dispatcher_reports_failure() {
    let dispatcher = Dispatcher::new(MockTransport::new(), fast_config());

    let rx = dispatcher.enqueue_tracked("early".to_string(), channel(), Priority::Urgent);

    assert!(!rx.await.unwrap());
    assert_eq!(dispatcher.queue_size(), 0);
    assert_eq!(dispatcher.transport().attempts(), 0);
}

#[tokio::test]
async fn test_rate_limit_pauses_and_resumes_automatically() {
    let transport = MockTransport::new().with_script([MockOutcome::RateLimited(Some(Duration::from_millis(150)))]);
    let dispatcher = Dispatcher::new(transport, fast_config());
    dispatcher.start().unwrap();

    let first = dispatcher.enqueue_tracked("first".to_string(), channel(), Priority::High);
    let second = dispatcher.enqueue_tracked("second".to_string(), channel(), Priority::Low);

    assert!(wait_until(WAIT, || dispatcher.is_paused()).await);
    // Nothing goes out while the retry-after window is open.
    assert!(dispatcher.transport().delivered().is_empty());

    assert!(tokio::time::timeout(WAIT, first).await.unwrap().unwrap());
    assert!(tokio::time::timeout(WAIT, second).await.unwrap().unwrap());
    assert_eq!(dispatcher.state(), DispatchState::Running);
    assert_eq!(dispatcher.stats().rate_limited, 1);
    assert_eq!(dispatcher.transport().attempts_for("first"), 2);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_panics_do_not_kill_the_worker() {
    let transport = MockTransport::new().with_script([MockOutcome::Panic("client bug".to_string())]);
    let dispatcher = Dispatcher::new(transport, fast_config());
    dispatcher.start().unwrap();

    let survivor = dispatcher.enqueue_tracked("survivor".to_string(), channel(), Priority::Urgent);
    dispatcher.enqueue_with_callback("noisy".to_string(), channel(), Priority::High, |_| {
        panic!("callback bug");
    });
    let later = dispatcher.enqueue_tracked("later".to_string(), channel(), Priority::Low);

    assert!(tokio::time::timeout(WAIT, survivor).await.unwrap().unwrap());
    assert!(tokio::time::timeout(WAIT, later).await.unwrap().unwrap());

    let stats = dispatcher.stats();
    assert_eq!(stats.transport_panics, 1);
    assert_eq!(stats.callback_panics, 1);
    assert_eq!(stats.sent, 3);

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_all_delivered() {
    let config = fast_config()
        .with_batch_size(50)
        .with_rate_limit(RateLimitConfig::new(Duration::from_millis(100), 1000));
    let dispatcher = Dispatcher::new(MockTransport::new(), config);
    dispatcher.start().unwrap();

    let producers = 8;
    let per_producer = 25;
    let mut handles = Vec::new();
    for p in 0..producers {
        let dispatcher = dispatcher.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_producer {
                let priority = Priority::ALL[(p + i) % Priority::ALL.len()];
                assert!(dispatcher.enqueue(format!("{p}-{i}"), channel(), priority));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total = (producers * per_producer) as u64;
    assert!(wait_until(WAIT, || dispatcher.stats().sent == total).await);

    let mut delivered = dispatcher.transport().delivered_payloads();
    delivered.sort();
    delivered.dedup();
    assert_eq!(delivered.len(), total as usize);
    assert_eq!(dispatcher.stats().enqueued, total);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_send_finish() {
    let transport = MockTransport::new().with_latency(Duration::from_millis(150));
    let dispatcher = Dispatcher::new(transport, fast_config());
    dispatcher.start().unwrap();

    let rx = dispatcher.enqueue_tracked("slow".to_string(), channel(), Priority::Normal);
    assert!(wait_until(WAIT, || dispatcher.transport().attempts() == 1).await);

    assert!(dispatcher.stop().await);

    assert!(rx.await.unwrap());
    assert_eq!(dispatcher.transport().delivered_payloads(), vec!["slow"]);
    assert_eq!(dispatcher.state(), DispatchState::Stopped);
}

#[tokio::test]
async fn test_stop_aborts_tick_that_overruns_grace() {
    let transport = MockTransport::new().with_latency(Duration::from_secs(10));
    let config = fast_config().with_stop_grace(Duration::from_millis(50));
    let dispatcher = Dispatcher::new(transport, config);
    dispatcher.start().unwrap();

    let rx = dispatcher.enqueue_tracked("stuck".to_string(), channel(), Priority::Normal);
    assert!(wait_until(WAIT, || dispatcher.transport().attempts() == 1).await);

    let started = Instant::now();
    assert!(dispatcher.stop().await);
    assert!(started.elapsed() < Duration::from_secs(2));

    // The aborted send never reports back.
    assert!(rx.await.is_err());
    assert!(dispatcher.transport().delivered().is_empty());
}

#[tokio::test]
async fn test_restart_after_stop() {
    let dispatcher = Dispatcher::new(MockTransport::new(), fast_config());
    dispatcher.start().unwrap();
    dispatcher.stop().await;

    assert!(!dispatcher.enqueue("while-stopped".to_string(), channel(), Priority::Normal));

    assert!(dispatcher.start().unwrap());
    let rx = dispatcher.enqueue_tracked("after-restart".to_string(), channel(), Priority::Normal);
    assert!(tokio::time::timeout(WAIT, rx).await.unwrap().unwrap());
    assert_eq!(dispatcher.transport().delivered_payloads(), vec!["after-restart"]);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_dispatcher_built_from_yaml_config() {
    let yaml = r#"
dispatch:
  tick_interval_ms: 10
  max_batch_size: 2
  rate_limit:
    window_ms: 50
    max_requests_per_window: 3
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert!(!config.validate().has_errors());

    let dispatcher = Dispatcher::new(MockTransport::new(), config.dispatcher_config());
    dispatcher.start().unwrap();

    let receivers: Vec<_> = (0..6)
        .map(|i| dispatcher.enqueue_tracked(format!("m{i}"), channel(), Priority::Normal))
        .collect();
    for rx in receivers {
        assert!(tokio::time::timeout(WAIT, rx).await.unwrap().unwrap());
    }

    // Two per tick, so six messages take at least three ticks.
    assert!(dispatcher.stats().ticks >= 3);
    assert_eq!(dispatcher.transport().delivered_payloads(), vec!["m0", "m1", "m2", "m3", "m4", "m5"]);

    dispatcher.stop().await;
}
