use anyhow::Result;
use bulkflow::io::cloud::StoreRegistry;
use bulkflow::source::Resolver;
use bulkflow::state::RunState;
use bulkflow::testing::*;
use bulkflow::{BufferQueue, RunConfig, ThrottleConfig};
use std::sync::Arc;
use std::time::Duration;

fn throttled(depth: usize) -> RunConfig {
    let mut config = RunConfig {
        dry_run: true,
        ..RunConfig::default()
    };
    config.input.force_stream = true;
    config.throttle = ThrottleConfig {
        sample_interval_ms: 2,
        paused_interval_ms: 2,
        depth,
        ..ThrottleConfig::default()
    };
    config
}

#[tokio::test]
async fn pressure_pauses_decoders_without_losing_records() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = write_jsonl(&dir.file_path("events.jsonl.gz"), &events(3_000))?;

    // Calm, then a long spike, then relief.
    let mut script = vec![0.2; 3];
    script.extend(std::iter::repeat_n(0.97, 20));
    script.push(0.5);
    let probe = Arc::new(ScriptedProbe::new(script));

    let state = Arc::new(RunState::new(throttled(256)));
    let resolver = Resolver::new(state, StoreRegistry::new(), probe.clone());
    let mut stream = resolver.resolve(path.into()).await?.into_stream().unwrap();
    let queue = stream.buffer().unwrap();

    let mut seen = Vec::with_capacity(3_000);
    while let Some(record) = stream.next().await {
        seen.push(record?);
        if seen.len() % 20 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    assert_eq!(sequence_of(&seen), (0..3_000).collect::<Vec<_>>());
    let stats = queue.stats();
    assert_eq!(stats.processed, 3_000);
    assert_eq!(stats.queued, 0);
    assert!(probe.reads() > 0);
    // The spike pauses the decoder and the relief sample resumes it.
    assert!(stats.pauses >= 1 && stats.resumes >= 1, "{stats:?}");
    Ok(())
}

#[tokio::test]
async fn queue_never_holds_more_than_its_depth() {
    let (producer, mut consumer) = BufferQueue::new(8);
    let handle = consumer.handle();
    let writer = tokio::task::spawn_blocking(move || {
        for r in sized_records(200, 64) {
            assert!(producer.push(r));
        }
    });

    let mut got = 0;
    while let Some(r) = consumer.pop().await {
        r.unwrap();
        got += 1;
        assert!(handle.stats().queued <= 8);
    }
    writer.await.unwrap();
    assert_eq!(got, 200);
    assert!(handle.is_finished());
}

#[tokio::test]
async fn raising_the_depth_lets_producers_run_ahead() {
    let (producer, mut consumer) = BufferQueue::new(1);
    let handle = consumer.handle();
    handle.set_depth(50);
    let writer = tokio::task::spawn_blocking(move || {
        for r in sized_records(50, 32) {
            assert!(producer.push(r));
        }
    });
    writer.await.unwrap();
    assert_eq!(handle.stats().queued, 50);
    assert_eq!(handle.stats().depth, 50);

    let mut got = 0;
    while consumer.pop().await.is_some() {
        got += 1;
    }
    assert_eq!(got, 50);
}

#[tokio::test]
async fn dropping_the_consumer_stops_producers() {
    let (producer, consumer) = BufferQueue::new(4);
    drop(consumer);
    assert!(!producer.push(sized_record(0, 32)));
    assert!(producer.is_closed());
}
