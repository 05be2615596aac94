use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::{Instant, interval};

use crate::config::BatchConfig;
use crate::engine::{BatchedClassifier, Classification, Classifier};

type ResponseSender = oneshot::Sender<Result<Classification>>;

#[derive(Debug)]
struct QueuedText {
    text: String,
    response_tx: ResponseSender,
}

/// Front half of the inference worker. Cheap to share between handlers.
pub struct BatchedClassifierWrapper {
    request_tx: flume::Sender<QueuedText>,
}

impl BatchedClassifierWrapper {
    pub fn new<T: BatchedClassifier + 'static>(
        config: BatchConfig,
        classifier: T,
    ) -> (Self, BatchProcessor<T>) {
        let (request_tx, request_rx) = flume::bounded(0); // Rendezvous channel

        let processor = BatchProcessor {
            request_rx,
            config,
            queue: VecDeque::new(),
            classifier,
        };

        (Self { request_tx }, processor)
    }
}

#[async_trait]
impl Classifier for BatchedClassifierWrapper {
    #[tracing::instrument(skip(self, text), fields(text_chars = text.chars().count()))]
    async fn classify(&self, text: String) -> Result<Classification> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send_async(QueuedText { text, response_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Inference queue is closed"))?;

        response_rx
            .await
            .map_err(|_| anyhow::anyhow!("Response channel closed"))?
    }
}

/// Back half of the inference worker. Owns the model; run it on its own task.
pub struct BatchProcessor<T: BatchedClassifier> {
    request_rx: flume::Receiver<QueuedText>,
    config: BatchConfig,
    queue: VecDeque<QueuedText>,
    classifier: T,
}

impl<T: BatchedClassifier> BatchProcessor<T> {
    #[tracing::instrument(skip(self))]
    pub async fn run_forever(mut self) -> Result<()> {
        let mut tick_timer = interval(self.config.tick_duration);

        loop {
            tokio::select! {
                request = self.request_rx.recv_async() => {
                    match request {
                        Ok(req) => {
                            self.queue.push_back(req);
                            tracing::trace!(queue_size = self.queue.len(), "Text queued");

                            if self.queue.len() >= self.config.batch_size {
                                self.process_batch().await;
                            }
                        }
                        Err(_) => {
                            tracing::info!("Channel closed, draining queue and exiting");
                            while !self.queue.is_empty() {
                                self.process_batch().await;
                            }
                            break Ok(());
                        }
                    }
                }

                _ = tick_timer.tick() => {
                    if !self.queue.is_empty() {
                        tracing::trace!(pending = self.queue.len(), "Tick fired with pending texts");
                        self.process_batch().await;
                    }
                }
            }
        }
    }

    async fn process_batch(&mut self) {
        let batch_start = Instant::now();

        let batch: Vec<_> = self
            .queue
            .drain(..self.config.batch_size.min(self.queue.len()))
            .collect();

        if batch.is_empty() {
            return;
        }

        let batch_size = batch.len();
        let (texts, response_channels): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|queued| (queued.text, queued.response_tx))
            .unzip();

        match self.classifier.classify_batch(texts).await {
            Ok(classifications) if classifications.len() == response_channels.len() => {
                for (response_tx, classification) in
                    response_channels.into_iter().zip(classifications)
                {
                    let _ = response_tx.send(Ok(classification));
                }
            }
            Ok(classifications) => {
                tracing::error!(
                    expected = response_channels.len(),
                    got = classifications.len(),
                    "Classifier returned the wrong number of results"
                );
                for response_tx in response_channels {
                    let _ = response_tx.send(Err(anyhow::anyhow!(
                        "Classifier returned {} results for {} texts",
                        classifications.len(),
                        batch_size
                    )));
                }
            }
            Err(err) => {
                tracing::error!("Batch inference failed: {err:#}");
                for response_tx in response_channels {
                    let _ = response_tx.send(Err(anyhow::anyhow!("Batch inference failed: {err}")));
                }
            }
        }

        tracing::debug!(
            batch_size,
            processing_time_ms = batch_start.elapsed().as_millis(),
            "Batch processed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scores texts by length and records how many forward passes ran.
    struct CountingClassifier {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl BatchedClassifier for CountingClassifier {
        async fn classify_batch(&self, texts: Vec<String>) -> Result<Vec<Classification>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("forward pass exploded");
            }
            texts
                .iter()
                .map(|t| {
                    if t.len() % 2 == 0 {
                        Classification::from_probs(vec![0.9, 0.1])
                    } else {
                        Classification::from_probs(vec![0.2, 0.8])
                    }
                })
                .collect()
        }
    }

    fn spawn_worker(fail: bool, batch_size: usize) -> (Arc<BatchedClassifierWrapper>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let classifier = CountingClassifier {
            calls: calls.clone(),
            fail,
        };
        let config = BatchConfig {
            batch_size,
            tick_duration: Duration::from_millis(5),
        };
        let (wrapper, processor) = BatchedClassifierWrapper::new(config, classifier);
        tokio::spawn(processor.run_forever());
        (Arc::new(wrapper), calls)
    }

    #[tokio::test]
    async fn single_text_round_trips_through_worker() {
        let (wrapper, calls) = spawn_worker(false, 4);

        let result = wrapper.classify("ab".to_string()).await.unwrap();
        assert_eq!(result.label, crate::engine::Label::Neither);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_texts_keep_their_own_results() {
        let (wrapper, _calls) = spawn_worker(false, 3);

        let texts: Vec<String> = (0..7).map(|n| "x".repeat(n + 1)).collect();
        let futures = texts.iter().map(|t| wrapper.classify(t.clone()));
        let results = futures::future::join_all(futures).await;

        for (text, result) in texts.iter().zip(results) {
            let expected = if text.len() % 2 == 0 {
                crate::engine::Label::Neither
            } else {
                crate::engine::Label::HateOffensive
            };
            assert_eq!(result.unwrap().label, expected, "text {text:?}");
        }
    }

    #[tokio::test]
    async fn batch_failure_reaches_every_caller() {
        let (wrapper, _calls) = spawn_worker(true, 2);

        let (a, b) = tokio::join!(
            wrapper.classify("one".to_string()),
            wrapper.classify("two".to_string())
        );
        assert!(a.unwrap_err().to_string().contains("forward pass exploded"));
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn closed_worker_reports_error() {
        let classifier = CountingClassifier {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
        };
        let config = BatchConfig {
            batch_size: 1,
            tick_duration: Duration::from_millis(5),
        };
        let (wrapper, processor) = BatchedClassifierWrapper::new(config, classifier);
        drop(processor);

        let err = wrapper.classify("late".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
