use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use vespa_feed_document::{Document, DocumentId};

use crate::{Error, OperationResult, Result, StatsCollector};

/// Number of times an operation is sent before its failure is final
pub const MAX_ATTEMPTS: usize = 10;

/// Something that can send one document and report how it went
#[async_trait]
pub trait Feeder: Debug + Send + Sync + 'static {
    async fn send(&self, document: &Document) -> OperationResult;
}

/// Configures and starts a [`Dispatcher`]
#[derive(Debug)]
pub struct DispatcherBuilder {
    feeder: Arc<dyn Feeder>,
    workers: usize,
    queue_capacity: usize,
    stats: Arc<StatsCollector>,
    results: Option<mpsc::UnboundedSender<OperationResult>>,
}

impl DispatcherBuilder {
    pub fn new(feeder: Arc<dyn Feeder>) -> Self {
        Self {
            feeder,
            workers: 256,
            queue_capacity: 4096,
            stats: Arc::new(StatsCollector::new()),
            results: None,
        }
    }

    /// Number of concurrent workers, each draining one document group at a time
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Number of ready groups that can wait for a worker before enqueueing blocks
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    /// Publish every final [`OperationResult`] on `results`
    pub fn results(mut self, results: mpsc::UnboundedSender<OperationResult>) -> Self {
        self.results = Some(results);
        self
    }

    /// Spawn the workers on the current tokio runtime
    pub fn start(self) -> Result<Dispatcher> {
        let runtime = tokio::runtime::Handle::try_current().map_err(Error::Runtime)?;
        let shared = Arc::new(Shared {
            feeder: self.feeder,
            groups: Mutex::new(HashMap::new()),
            stats: self.stats,
            results: self.results,
        });

        let (ready_tx, ready_rx) = mpsc::channel(self.queue_capacity);
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));
        let workers = (0..self.workers)
            .map(|_| runtime.spawn(run_worker(Arc::clone(&shared), Arc::clone(&ready_rx))))
            .collect();

        Ok(Dispatcher {
            shared,
            ready: Mutex::new(Some(ready_tx)),
            workers: tokio::sync::Mutex::new(workers),
        })
    }
}

/// Feeds documents concurrently while applying operations on the same [`DocumentId`] in
/// the order they were enqueued
///
/// Operations are grouped by id. A worker takes a whole group and drains it, retrying each
/// operation up to [`MAX_ATTEMPTS`] times. If an operation still fails, the rest of its
/// group is abandoned rather than applied out of order.
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    ready: Mutex<Option<mpsc::Sender<DocumentId>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn builder(feeder: Arc<dyn Feeder>) -> DispatcherBuilder {
        DispatcherBuilder::new(feeder)
    }

    /// Queue `document` behind any pending operations on the same id
    ///
    /// Only waits when too many groups are already waiting for a worker.
    pub async fn enqueue(&self, document: Document) -> Result<()> {
        let ready = self.ready.lock().clone().ok_or(Error::DispatcherClosed)?;

        let id = document.id().clone();
        let created = {
            let mut groups = self.shared.groups.lock();
            match groups.entry(id.clone()) {
                Entry::Occupied(group) => {
                    group.get().lock().operations.push_back(document);
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(Mutex::new(DocumentGroup::new(document))));
                    true
                }
            }
        };

        if created {
            ready.send(id).await.map_err(|_| Error::DispatcherClosed)?;
        }
        Ok(())
    }

    /// Stop accepting documents and wait until everything enqueued so far is done
    pub async fn close(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        drop(self.ready.lock().take());
        let mut first_error = None;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "dispatcher worker failed");
                first_error.get_or_insert(Error::Worker(e));
            }
        }
        info!("dispatcher closed");
        first_error.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.shared.stats
    }

    /// Operations currently being sent
    pub fn inflight(&self) -> i64 {
        self.shared.stats.inflight()
    }
}

/// The pending operations for one id
#[derive(Debug)]
struct DocumentGroup {
    operations: VecDeque<Document>,
    failed: bool,
}

impl DocumentGroup {
    fn new(document: Document) -> Self {
        Self {
            operations: VecDeque::from([document]),
            failed: false,
        }
    }
}

#[derive(Debug)]
struct Shared {
    feeder: Arc<dyn Feeder>,
    /// Live groups; lock before any group when holding both
    groups: Mutex<HashMap<DocumentId, Arc<Mutex<DocumentGroup>>>>,
    stats: Arc<StatsCollector>,
    results: Option<mpsc::UnboundedSender<OperationResult>>,
}

impl Shared {
    async fn drain_group(&self, id: DocumentId) {
        let Some(group) = self.groups.lock().get(&id).map(Arc::clone) else {
            return;
        };

        while let Some((document, failed)) = self.next_operation(&id, &group) {
            if failed {
                self.abandon(document);
                continue;
            }
            let result = self.send(&document).await;
            if !result.success() {
                warn!(%document, %result, "operation failed, abandoning the rest of its group");
                group.lock().failed = true;
            }
            self.publish(result);
        }
    }

    /// Take the next operation of `group`, along with whether the group has failed
    ///
    /// An empty group is removed from the directory, so the next enqueue for its id starts
    /// a new one.
    fn next_operation(
        &self,
        id: &DocumentId,
        group: &Mutex<DocumentGroup>,
    ) -> Option<(Document, bool)> {
        {
            let mut group = group.lock();
            if let Some(document) = group.operations.pop_front() {
                return Some((document, group.failed));
            }
        }

        let mut groups = self.groups.lock();
        let mut group = group.lock();
        match group.operations.pop_front() {
            Some(document) => Some((document, group.failed)),
            None => {
                groups.remove(id);
                None
            }
        }
    }

    async fn send(&self, document: &Document) -> OperationResult {
        self.stats.operation_started();
        let mut attempt = 1;
        let result = loop {
            let result = self.feeder.send(document).await;
            if result.success() || attempt >= MAX_ATTEMPTS {
                break result;
            }
            debug!(id = %document.id(), attempt, status = %result.status, "retrying operation");
            attempt += 1;
        };
        self.stats.operation_finished(&result);
        result
    }

    fn abandon(&self, document: Document) {
        let id = document.id().clone();
        debug!(%document, "abandoning operation");
        let result =
            OperationResult::new(id.clone()).with_error(Error::GroupFailed { id });
        self.stats.operation_abandoned(&result);
        self.publish(result);
    }

    fn publish(&self, result: OperationResult) {
        if let Some(results) = &self.results {
            // nobody listening is fine
            let _ = results.send(result);
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    ready: Arc<tokio::sync::Mutex<mpsc::Receiver<DocumentId>>>,
) {
    loop {
        let id = ready.lock().await.recv().await;
        let Some(id) = id else {
            break;
        };
        shared.drain_group(id).await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Status;

    /// Succeeds unless told to fail a document a number of times
    #[derive(Debug, Default)]
    struct MockFeeder {
        sent: Mutex<Vec<String>>,
        failures: Mutex<HashMap<String, usize>>,
    }

    impl MockFeeder {
        fn fail(&self, document: &Document, times: usize) {
            self.failures.lock().insert(document.to_string(), times);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Feeder for MockFeeder {
        async fn send(&self, document: &Document) -> OperationResult {
            let key = document.to_string();
            self.sent.lock().push(key.clone());
            tokio::task::yield_now().await;

            let failing = match self.failures.lock().get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            let result = OperationResult::new(document.id().clone());
            if failing {
                result.with_status(Status::VespaFailure, 502)
            } else {
                result.with_status(Status::Success, 200)
            }
        }
    }

    fn id(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    fn put(s: &str) -> Document {
        Document::put(id(s), "{}")
    }

    fn update(s: &str) -> Document {
        Document::update(id(s), "{}")
    }

    fn remove(s: &str) -> Document {
        Document::remove(id(s))
    }

    fn start(
        feeder: &Arc<MockFeeder>,
        workers: usize,
    ) -> (Dispatcher, mpsc::UnboundedReceiver<OperationResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::builder(Arc::clone(feeder) as _)
            .workers(workers)
            .results(tx)
            .start()
            .unwrap();
        (dispatcher, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OperationResult>) -> Vec<OperationResult> {
        let mut results = vec![];
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        results
    }

    #[test_log::test(tokio::test)]
    async fn failed_operation_is_not_retried_forever() {
        let feeder = Arc::new(MockFeeder::default());
        let doc1_update = update("id:ns:t::doc1");
        feeder.fail(&doc1_update, MAX_ATTEMPTS);
        let (dispatcher, mut rx) = start(&feeder, 4);

        dispatcher.enqueue(put("id:ns:t::doc1")).await.unwrap();
        dispatcher.enqueue(put("id:ns:t::doc2")).await.unwrap();
        dispatcher.enqueue(doc1_update.clone()).await.unwrap();
        dispatcher.close().await.unwrap();

        let results = drain(&mut rx);
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.success()).count(), 2);
        let failed: Vec<_> = results.iter().filter(|r| !r.success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id("id:ns:t::doc1"));
        assert_eq!(failed[0].status, Status::VespaFailure);

        let update_sends = feeder
            .sent()
            .into_iter()
            .filter(|s| *s == doc1_update.to_string())
            .count();
        assert_eq!(update_sends, MAX_ATTEMPTS);
        assert_eq!(feeder.sent().len(), 2 + MAX_ATTEMPTS);

        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.successes(), 2);
        assert_eq!(stats.unsuccessful(), 1);
        assert_eq!(stats.inflight, 0);
    }

    #[test_log::test(tokio::test)]
    async fn failure_abandons_rest_of_group() {
        let feeder = Arc::new(MockFeeder::default());
        let doc1_put = put("id:ns:t::doc1");
        feeder.fail(&doc1_put, MAX_ATTEMPTS);
        let (dispatcher, mut rx) = start(&feeder, 2);

        dispatcher.enqueue(doc1_put.clone()).await.unwrap();
        dispatcher.enqueue(update("id:ns:t::doc1")).await.unwrap();
        dispatcher.enqueue(put("id:ns:t::doc2")).await.unwrap();
        dispatcher.enqueue(remove("id:ns:t::doc1")).await.unwrap();
        dispatcher.close().await.unwrap();

        let doc1: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|r| r.id == id("id:ns:t::doc1"))
            .collect();
        assert_eq!(doc1.len(), 3);
        assert_eq!(doc1[0].status, Status::VespaFailure);
        for abandoned in &doc1[1..] {
            assert!(matches!(
                abandoned.error.as_deref(),
                Some(Error::GroupFailed { .. })
            ));
        }

        let sent = feeder.sent();
        assert_eq!(sent.len(), MAX_ATTEMPTS + 1);
        assert!(sent.iter().all(|s| s.contains("doc2") || *s == doc1_put.to_string()));

        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.inflight, 0);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let feeder = Arc::new(MockFeeder::default());
        let document = put("id:ns:t::doc1");
        feeder.fail(&document, MAX_ATTEMPTS - 1);
        let (dispatcher, mut rx) = start(&feeder, 1);

        dispatcher.enqueue(document).await.unwrap();
        dispatcher.close().await.unwrap();

        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::Success);
        assert_eq!(feeder.sent().len(), MAX_ATTEMPTS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn preserves_order_per_id() {
        let feeder = Arc::new(MockFeeder::default());
        let (dispatcher, mut rx) = start(&feeder, 8);

        let mut expected: HashMap<DocumentId, Vec<String>> = HashMap::new();
        for round in 0..20 {
            for doc in 0..10 {
                let document =
                    Document::update(id(&format!("id:ns:t::doc{doc}")), "{}")
                        .with_condition(format!("round=={round}"));
                expected
                    .entry(document.id().clone())
                    .or_default()
                    .push(document.to_string());
                dispatcher.enqueue(document).await.unwrap();
            }
        }
        dispatcher.close().await.unwrap();

        let mut sent: HashMap<DocumentId, Vec<String>> = HashMap::new();
        for s in feeder.sent() {
            let id = id(s.split_whitespace().nth(1).unwrap().trim_end_matches(','));
            sent.entry(id).or_default().push(s);
        }
        assert_eq!(sent, expected);

        let results = drain(&mut rx);
        assert_eq!(results.len(), 200);
        assert!(results.iter().all(|r| r.success()));
        assert!(dispatcher.shared.groups.lock().is_empty());
    }

    #[tokio::test]
    async fn drained_group_is_replaced() {
        let feeder = Arc::new(MockFeeder::default());
        let doc1_put = put("id:ns:t::doc1");
        feeder.fail(&doc1_put, MAX_ATTEMPTS);
        let (dispatcher, mut rx) = start(&feeder, 2);

        dispatcher.enqueue(doc1_put).await.unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, Status::VespaFailure);

        // the failed group has drained, so this starts a healthy one
        dispatcher.enqueue(update("id:ns:t::doc1")).await.unwrap();
        let result = rx.recv().await.unwrap();
        assert_eq!(result.status, Status::Success);

        dispatcher.close().await.unwrap();
        assert!(dispatcher.shared.groups.lock().is_empty());
    }

    #[tokio::test]
    async fn enqueue_after_close() {
        let feeder = Arc::new(MockFeeder::default());
        let (dispatcher, _rx) = start(&feeder, 2);
        dispatcher.enqueue(put("id:ns:t::doc1")).await.unwrap();
        dispatcher.close().await.unwrap();
        dispatcher.close().await.unwrap();

        let err = dispatcher.enqueue(put("id:ns:t::doc2")).await.unwrap_err();
        assert!(matches!(err, Error::DispatcherClosed));
        assert_eq!(feeder.sent().len(), 1);
    }

    /// Panics on one id, and is slow for every other
    #[derive(Debug)]
    struct PanickingFeeder;

    #[async_trait]
    impl Feeder for PanickingFeeder {
        async fn send(&self, document: &Document) -> OperationResult {
            if document.id().user_specific() == "boom" {
                panic!("feeder failed on {document}");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            OperationResult::new(document.id().clone()).with_status(Status::Success, 200)
        }
    }

    #[tokio::test]
    async fn close_waits_for_every_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::builder(Arc::new(PanickingFeeder) as _)
            .workers(4)
            .results(tx)
            .start()
            .unwrap();

        dispatcher.enqueue(put("id:ns:t::boom")).await.unwrap();
        for i in 0..10 {
            dispatcher
                .enqueue(put(&format!("id:ns:t::doc{i}")))
                .await
                .unwrap();
        }

        let err = dispatcher.close().await.unwrap_err();
        assert!(matches!(err, Error::Worker(e) if e.is_panic()));

        // everything the surviving workers picked up is finished
        let results = drain(&mut rx);
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.success()));
    }
}
