use super::{BufferQueue, MemoryProbe, ThrottleConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

impl BufferQueue {
    /// Start the memory sampler for this queue.
    ///
    /// Every `sample_interval` the probe is read; above `high_water` the
    /// producer gate closes and sampling slows to `paused_interval` until
    /// occupancy falls below `low_water`. The task ends on its own once the
    /// queue is finished.
    pub fn spawn_sampler(
        &self,
        probe: Arc<dyn MemoryProbe>,
        config: ThrottleConfig,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut interval = config.sample_interval();
            loop {
                tokio::time::sleep(interval).await;
                if queue.is_finished() {
                    break;
                }
                let occupancy = probe.occupancy();
                queue.record_occupancy(occupancy);
                if !queue.is_paused() && occupancy > config.high_water {
                    queue.pause();
                    interval = config.paused_interval();
                    info!(
                        occupancy = format_args!("{occupancy:.3}"),
                        high_water = config.high_water,
                        "memory pressure: pausing producers"
                    );
                } else if queue.is_paused() && occupancy < config.low_water {
                    queue.resume();
                    interval = config.sample_interval();
                    info!(
                        occupancy = format_args!("{occupancy:.3}"),
                        low_water = config.low_water,
                        "memory pressure relieved: resuming producers"
                    );
                }
            }
            // Never leave a producer parked behind a closed gate.
            queue.resume();
            debug!(stats = ?queue.stats(), "memory sampler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProbe;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn pauses_and_resumes_without_loss() {
        let (producer, mut consumer) = BufferQueue::new(64);
        let probe = Arc::new(ScriptedProbe::new([0.1, 0.95, 0.95, 0.2]));
        let config = ThrottleConfig {
            sample_interval_ms: 5,
            paused_interval_ms: 5,
            ..ThrottleConfig::default()
        };
        consumer.handle().spawn_sampler(probe, config);

        let sent = 500u64;
        let writer = tokio::task::spawn_blocking(move || {
            for i in 0..sent {
                let rec = json!({ "i": i }).as_object().cloned().unwrap();
                assert!(producer.push(rec));
            }
        });

        let mut received = 0u64;
        while let Some(r) = consumer.pop().await {
            assert_eq!(r.unwrap()["i"], json!(received));
            received += 1;
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        writer.await.unwrap();

        let stats = consumer.handle().stats();
        assert_eq!(received, sent);
        assert!(stats.pauses >= 1, "{stats:?}");
        assert!(stats.resumes >= 1, "{stats:?}");
    }
}
