mod image_caption;

use crate::{loader, HandlerPayload};
use futures::Future;
pub use image_caption::*;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    /// Spawn a dedicated worker thread that owns the model.
    ///
    /// With `offload_duration` set to `None` the model is loaded as soon as the
    /// worker starts and stays resident. With `Some(duration)` it is loaded on
    /// the first request and dropped again after `duration` without requests.
    pub fn new<T, TFut, TFn>(
        model_id: String, // for better logging
        create_model: TFn,
        offload_duration: Option<Duration>,
    ) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + Send + 'static,
        TFut: Future<Output = anyhow::Result<T>> + Send + 'static,
        TFn: Fn() -> TFut + Send + 'static,
    {
        let loader = loader::ModelLoader::new(create_model);
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let worker_model_id = model_id.clone();
        std::thread::Builder::new()
            .name(format!("ai-model-{}", model_id))
            .spawn(move || {
                let local = tokio::task::LocalSet::new();
                let model_id = worker_model_id;

                local.spawn_local(async move {
                    if offload_duration.is_none() {
                        tracing::info!(model_id = %model_id, "preloading model");
                        if let Err(e) = loader.load().await {
                            tracing::error!(model_id = %model_id, "failed to preload model: {:#}", e);
                        }
                    }

                    loop {
                        let payload = match offload_duration {
                            Some(duration) => tokio::select! {
                                _ = tokio::time::sleep(duration) => None,
                                payload = rx.recv() => Some(payload),
                            },
                            None => Some(rx.recv().await),
                        };

                        let Some(payload) = payload else {
                            if loader.is_loaded().await {
                                tracing::debug!(model_id = %model_id, "No message received for {:?}, offload model", offload_duration);
                                if let Err(e) = loader.offload().await {
                                    tracing::error!(model_id = %model_id, "failed to offload model: {}", e);
                                }
                            }
                            continue;
                        };

                        match payload {
                            Some((items, result_tx)) => {
                                // If channel closed,
                                // we have no way to response, just ignore task.
                                if result_tx.is_closed() {
                                    tracing::debug!(model_id = %model_id, "receiver dropped, skip task");
                                    continue;
                                }

                                if let Err(e) = loader.load().await {
                                    tracing::error!(model_id = %model_id, "failed to load model: {:#}", e);
                                    let _ = result_tx.send(Err(anyhow::anyhow!("failed to load model: {:#}", e)));
                                    continue;
                                }

                                let mut model = loader.model.lock().await;
                                let results = match model.as_mut() {
                                    Some(model) => model.process(items).await,
                                    None => {
                                        tracing::error!(model_id = %model_id, "no valid model");
                                        Err(anyhow::anyhow!("failed to load model"))
                                    }
                                };

                                if result_tx.send(results).is_err() {
                                    tracing::error!(model_id = %model_id, "failed to send results");
                                }
                            }
                            None => {
                                // this means all tx has been dropped
                                if loader.is_loaded().await {
                                    tracing::info!(model_id = %model_id, "all tx dropped, offload model and end loop");
                                    if let Err(e) = loader.offload().await {
                                        tracing::error!(model_id = %model_id, "failed to offload model: {}", e);
                                    }
                                }
                                break;
                            }
                        }
                    }
                });

                rt.block_on(local);
            })?;

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        match self.tx.send((items, result_tx)).await {
            Ok(_) => {
                tracing::debug!("items sent to model");
            }
            Err(e) => {
                anyhow::bail!("failed to send items: {:?}", e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::{AIModel, Model};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    struct Upper;

    impl Model for Upper {
        type Item = String;
        type Output = String;

        fn batch_size_limit(&self) -> usize {
            4
        }

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            if items.len() > self.batch_size_limit() {
                anyhow::bail!("too many items");
            }
            Ok(items
                .into_iter()
                .map(|v| {
                    if v.is_empty() {
                        Err(anyhow::anyhow!("empty item"))
                    } else {
                        Ok(v.to_uppercase())
                    }
                })
                .collect())
        }
    }

    fn counting_model(
        loads: Arc<AtomicUsize>,
        offload_duration: Option<Duration>,
    ) -> AIModel<String, String> {
        AIModel::new(
            "upper".into(),
            move || {
                let loads = loads.clone();
                async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Upper)
                }
            },
            offload_duration,
        )
        .expect("create model")
    }

    /// Counts calls and drops, and takes a while per batch.
    struct Slow {
        calls: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Slow {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Model for Slow {
        type Item = String;
        type Output = String;

        fn batch_size_limit(&self) -> usize {
            1
        }

        async fn process(
            &mut self,
            items: Vec<Self::Item>,
        ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(items.into_iter().map(Ok).collect())
        }
    }

    fn slow_model(calls: Arc<AtomicUsize>, drops: Arc<AtomicUsize>) -> AIModel<String, String> {
        AIModel::new(
            "slow".into(),
            move || {
                let calls = calls.clone();
                let drops = drops.clone();
                async move { Ok(Slow { calls, drops }) }
            },
            None,
        )
        .expect("create model")
    }

    #[test_log::test(tokio::test)]
    async fn test_process() {
        let model = counting_model(Arc::new(AtomicUsize::new(0)), None);

        let results = model
            .process(vec!["a".into(), "".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), "A");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap(), "C");

        assert!(model.process(vec!["x".into(); 5]).await.is_err());

        let single = model.process_single("hello".into()).await.unwrap();
        assert_eq!(single, "HELLO");
        assert!(model.process_single("".into()).await.is_err());
    }

    #[test_log::test(tokio::test)]
    async fn test_resident_model_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(loads.clone(), None);

        for _ in 0..3 {
            model.process_single("a".into()).await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_offload_after_idle() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(loads.clone(), Some(Duration::from_millis(50)));

        // nothing is loaded until the first request
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        model.process_single("a".into()).await.unwrap();
        model.process_single("b".into()).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        model.process_single("c".into()).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_load_failure_is_reported() {
        let model: AIModel<String, String> = AIModel::new(
            "broken".into(),
            || async { Err::<Upper, _>(anyhow::anyhow!("weights not found")) },
            None,
        )
        .expect("create model");

        let err = model.process_single("a".into()).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("failed to load model"), "{}", message);
        assert!(message.contains("weights not found"), "{}", message);
    }

    #[test_log::test(tokio::test)]
    async fn test_clone_shares_worker() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(loads.clone(), None);
        let cloned = model.clone();
        drop(model);

        assert_eq!(cloned.model_id(), "upper");
        assert_eq!(cloned.process_single("z".into()).await.unwrap(), "Z");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancelled_request_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = slow_model(calls.clone(), Arc::new(AtomicUsize::new(0)));

        let busy = {
            let model = model.clone();
            tokio::spawn(async move { model.process_single("first".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // queued behind the busy request, caller gives up before it is picked up
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), model.process_single("second".into()))
                .await;
        assert!(cancelled.is_err());

        assert_eq!(model.process_single("third".into()).await.unwrap(), "third");
        assert_eq!(busy.await.unwrap().unwrap(), "first");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_exits_when_handles_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let model = slow_model(Arc::new(AtomicUsize::new(0)), drops.clone());
        let cloned = model.clone();

        assert_eq!(model.process_single("a".into()).await.unwrap(), "a");
        drop(model);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(cloned);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while drops.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
