//! # Enhancement Worker Pool
//!
//! A fixed set of workers pulling sealed utterances from a bounded queue.
//! The queue bound is the backpressure mechanism: when every worker is busy
//! and the queue is full, `enqueue` does not complete, which delays the
//! session's ack and slows the device down instead of buffering without
//! limit.
//!
//! ## Concurrency:
//! - Producers: one per live session (the connection actors)
//! - Consumers: `enhancement_workers` tasks sharing one receiver
//! - DSP runs on the blocking thread pool so a long utterance never stalls
//!   the async runtime

use crate::audio::Utterance;
use crate::enhancement::pipeline::{EnhancementPipeline, EnhancementResult};
use crate::enhancement::profile::ProcessingProfile;
use crate::error::{AppError, AppResult};
use crate::state::GatewayMetrics;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

struct Job {
    utterance: Utterance,
    profile: ProcessingProfile,
    reply: oneshot::Sender<EnhancementResult>,
}

/// Handle to the shared enhancement workers.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` consumer tasks behind a queue of `queue_capacity`
    /// pending utterances.
    pub fn new(workers: usize, queue_capacity: usize, metrics: Arc<GatewayMetrics>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            info!(worker_id, "Enhancement worker shutting down");
                            break;
                        };

                        let pipeline = EnhancementPipeline::new(job.profile);
                        let utterance = job.utterance;
                        let run =
                            tokio::task::spawn_blocking(move || pipeline.run(&utterance)).await;

                        match run {
                            Ok(result) => {
                                GatewayMetrics::incr(&metrics.enhancements_completed);
                                if result.failed_stage.is_some() {
                                    GatewayMetrics::incr(&metrics.enhancement_stage_failures);
                                }
                                // Session may have been destroyed while we worked
                                let _ = job.reply.send(result);
                            }
                            Err(e) => {
                                error!(worker_id, error = %e, "Enhancement task panicked");
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
        }
    }

    /// Queue an utterance for enhancement.
    ///
    /// Completes once the job is accepted into the queue; under load this is
    /// where a session waits, which is what delays its ack to the device.
    /// The returned receiver yields the result when a worker finishes.
    pub async fn enqueue(
        &self,
        utterance: Utterance,
        profile: ProcessingProfile,
    ) -> AppResult<oneshot::Receiver<EnhancementResult>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                utterance,
                profile,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AppError::Internal("enhancement worker pool is gone".to_string()))?;
        Ok(reply_rx)
    }

    /// Close the queue and wait for in-flight work to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::enhancement::profile::{ProcessingProfile, ProfileLevel};
    use uuid::Uuid;

    fn utterance_with_tone() -> Utterance {
        let mut utt = Utterance::new(Uuid::new_v4());
        utt.samples = (0..16000)
            .map(|i| {
                let s = 0.4 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin();
                (s * 32767.0) as i16
            })
            .collect();
        utt.complete();
        utt
    }

    #[tokio::test]
    async fn test_pool_processes_jobs() {
        let cfg = AppConfig::default();
        let metrics = Arc::new(GatewayMetrics::default());
        let pool = WorkerPool::new(2, 4, Arc::clone(&metrics));

        let profile = ProcessingProfile::new(ProfileLevel::High, &cfg.enhancement, 16000);
        let rx = pool.enqueue(utterance_with_tone(), profile).await.unwrap();
        let result = rx.await.unwrap();

        assert_eq!(result.steps_applied.len(), 5);
        assert_eq!(GatewayMetrics::get(&metrics.enhancements_completed), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_handles_concurrent_jobs() {
        let cfg = AppConfig::default();
        let metrics = Arc::new(GatewayMetrics::default());
        let pool = WorkerPool::new(2, 2, Arc::clone(&metrics));
        let profile = ProcessingProfile::new(ProfileLevel::Medium, &cfg.enhancement, 16000);

        let mut receivers = Vec::new();
        for _ in 0..6 {
            let rx = pool
                .enqueue(utterance_with_tone(), profile.clone())
                .await
                .unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            let result = rx.await.unwrap();
            assert_eq!(result.steps_applied.len(), 3);
        }
        assert_eq!(GatewayMetrics::get(&metrics.enhancements_completed), 6);
        pool.shutdown().await;
    }
}
