//! Integration tests for the full delivery pipeline.
//!
//! Tests: TaskStore → compose → BatchDispatcher → reconcile → TaskStore
//!
//! Verifies:
//! - Retry, backoff and exhaustion across scheduler cycles
//! - One output and one job update per dispatched job
//! - Claims are released no matter what happened during the cycle
//! - Concurrent claimers never receive the same job

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;

    use relayq_core::{Clock, Code, Job, ManualClock, Output, QueueId, ResponseHeaders};

    use crate::jobs::{
        HttpResponse, InMemoryTaskStore, PersistSummary, RequestSpec, Scheduler, SchedulerConfig,
        SchedulerError, TaskStore, TaskStoreError, Transport, TransportError,
    };

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Status(u16),
        Refused,
        Hang,
    }

    /// Answers each URL from a script; unscripted calls get `200`.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn script(&self, url: &str, replies: &[Reply]) {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), replies.iter().copied().collect());
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &RequestSpec) -> Result<HttpResponse, TransportError> {
            *self.calls.lock().unwrap().entry(request.url.clone()).or_default() += 1;
            let reply = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&request.url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Reply::Status(200));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match reply {
                Reply::Status(status) => Ok(HttpResponse {
                    status_code: status,
                    status_message: format!("status {status}"),
                    headers: ResponseHeaders::new(),
                    body: format!("body {status}"),
                }),
                Reply::Refused => Err(TransportError::Connect("connection refused".to_string())),
                Reply::Hang => {
                    tokio::time::sleep(StdDuration::from_secs(60)).await;
                    Ok(HttpResponse {
                        status_code: 200,
                        status_message: String::new(),
                        headers: ResponseHeaders::new(),
                        body: String::new(),
                    })
                }
            }
        }
    }

    /// In-memory store with switchable failures.
    struct FlakyStore {
        inner: InMemoryTaskStore,
        fail_claim: AtomicBool,
        fail_persist: AtomicBool,
        /// Number of upcoming `release_claims` calls that fail.
        failing_releases: AtomicUsize,
        /// Jobs handed out by the next claim on top of the real ones.
        forced: Mutex<Vec<Job>>,
    }

    impl FlakyStore {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                inner: InMemoryTaskStore::with_clock(clock),
                fail_claim: AtomicBool::new(false),
                fail_persist: AtomicBool::new(false),
                failing_releases: AtomicUsize::new(0),
                forced: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn enqueue(&self, job: Job) -> Result<Code, TaskStoreError> {
            self.inner.enqueue(job).await
        }

        async fn get_job(&self, code: &Code) -> Result<Option<Job>, TaskStoreError> {
            self.inner.get_job(code).await
        }

        async fn list_outputs(&self, job_code: &Code) -> Result<Vec<Output>, TaskStoreError> {
            self.inner.list_outputs(job_code).await
        }

        async fn claim_due_jobs(&self, limit: usize, offset: usize) -> Result<Vec<Job>, TaskStoreError> {
            if self.fail_claim.load(Ordering::SeqCst) {
                return Err(TaskStoreError::Transaction("deadlock detected".to_string()));
            }
            let mut jobs = self.inner.claim_due_jobs(limit, offset).await?;
            jobs.append(&mut self.forced.lock().unwrap());
            Ok(jobs)
        }

        async fn persist_job_updates(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
            self.inner.persist_job_updates(jobs).await
        }

        async fn write_outputs(&self, outputs: &[Output]) -> Result<(), TaskStoreError> {
            self.inner.write_outputs(outputs).await
        }

        async fn persist_outcomes(
            &self,
            jobs: &[Job],
            outputs: &[Output],
        ) -> Result<PersistSummary, TaskStoreError> {
            if self.fail_persist.load(Ordering::SeqCst) {
                return Err(TaskStoreError::Storage("disk full".to_string()));
            }
            self.inner.persist_outcomes(jobs, outputs).await
        }

        async fn release_claims(&self, jobs: &[Job]) -> Result<u64, TaskStoreError> {
            let failing = self
                .failing_releases
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TaskStoreError::Storage("connection reset".to_string()));
            }
            self.inner.release_claims(jobs).await
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryTaskStore>,
        transport: Arc<ScriptedTransport>,
        scheduler: Scheduler<Arc<InMemoryTaskStore>, ScriptedTransport>,
    }

    fn harness(config: SchedulerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = Scheduler::new(store.clone(), transport.clone(), config)
            .with_clock(clock.clone());
        Harness {
            clock,
            store,
            transport,
            scheduler,
        }
    }

    fn job(clock: &ManualClock, url: &str, retries: u32, retry_delay: u32) -> Job {
        Job::new(QueueId::new(), "callback", url, clock.now()).with_retries(retries, retry_delay)
    }

    #[tokio::test]
    async fn scenario_a_single_attempt_success() {
        let h = harness(SchedulerConfig::default());
        let code = h.store.enqueue(job(&h.clock, "/a", 1, 10)).await.unwrap();

        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.released, 1);

        let stored = h.store.get_job(&code).await.unwrap().unwrap();
        assert!(stored.is_successful);
        assert_eq!(stored.tried_counts, 1);
        assert!(!stored.is_processing);

        h.clock.advance(Duration::days(1));
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(h.transport.calls("/a"), 1);
        assert_eq!(h.store.list_outputs(&code).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scenario_b_retries_with_backoff_then_succeeds() {
        let h = harness(SchedulerConfig::default());
        h.transport
            .script("/b", &[Reply::Status(500), Reply::Status(500), Reply::Status(200)]);
        let code = h.store.enqueue(job(&h.clock, "/b", 3, 10)).await.unwrap();

        for attempt in 1..=2u32 {
            let attempted_at = h.clock.now();
            let report = h.scheduler.run_cycle().await.unwrap();
            assert_eq!(report.failed, 1);

            let stored = h.store.get_job(&code).await.unwrap().unwrap();
            assert_eq!(stored.tried_counts, attempt);
            assert!(!stored.is_successful);
            assert_eq!(stored.next_execution, attempted_at + Duration::seconds(10));

            // Not due yet.
            h.clock.advance(Duration::seconds(9));
            assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 0);
            h.clock.advance(Duration::seconds(1));
        }

        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.succeeded, 1);

        let stored = h.store.get_job(&code).await.unwrap().unwrap();
        assert_eq!(stored.tried_counts, 3);
        assert!(stored.is_successful);

        let outputs = h.store.list_outputs(&code).await.unwrap();
        let statuses: Vec<u16> = outputs.iter().map(|o| o.status_code).collect();
        assert_eq!(statuses, vec![500, 500, 200]);
        assert!(outputs.iter().all(|o| stored.owns_output(o)));
    }

    #[tokio::test]
    async fn scenario_c_unreachable_callback_is_exhausted() {
        let h = harness(SchedulerConfig::default());
        h.transport.script("/c", &[Reply::Refused, Reply::Refused]);
        let code = h.store.enqueue(job(&h.clock, "/c", 2, 5)).await.unwrap();

        h.scheduler.run_cycle().await.unwrap();
        h.clock.advance(Duration::seconds(5));
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.exhausted, 1);

        let stored = h.store.get_job(&code).await.unwrap().unwrap();
        assert_eq!(stored.tried_counts, 2);
        assert!(!stored.is_successful);
        assert!(stored.is_exhausted());

        let outputs = h.store.list_outputs(&code).await.unwrap();
        assert_eq!(outputs.len(), 2);
        for output in &outputs {
            assert_eq!(output.status_code, 500);
            assert!(output.content.starts_with("Queue server exception: Connection problem: "));
        }

        // Exhaustion is idempotent.
        for _ in 0..3 {
            h.clock.advance(Duration::days(1));
            assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 0);
        }
        assert_eq!(h.transport.calls("/c"), 2);
        assert_eq!(h.store.list_outputs(&code).await.unwrap().len(), 2);
        assert_eq!(h.scheduler.stats().jobs_exhausted, 1);
    }

    #[tokio::test]
    async fn every_dispatched_job_gets_one_output_and_update() {
        let h = harness(
            SchedulerConfig::default().with_request_deadline(StdDuration::from_millis(100)),
        );
        h.transport.script("/fail", &[Reply::Status(404)]);
        h.transport.script("/refused", &[Reply::Refused]);
        h.transport.script("/hang", &[Reply::Hang]);

        let mut codes = Vec::new();
        for url in ["/ok", "/fail", "/refused", "/hang", "/ok2"] {
            codes.push(h.store.enqueue(job(&h.clock, url, 3, 1)).await.unwrap());
        }

        let report = h.scheduler.run_cycle().await.unwrap();

        assert_eq!(report.dispatched, 5);
        assert_eq!(report.written_outputs, 5);
        assert_eq!(report.persisted_jobs, 5);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 3);
        assert_eq!(h.store.output_count().unwrap(), 5);
        for code in &codes {
            let stored = h.store.get_job(code).await.unwrap().unwrap();
            assert_eq!(stored.tried_counts, 1);
            assert!(!stored.is_processing);
        }
    }

    #[tokio::test]
    async fn zero_retry_jobs_are_skipped_but_released() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::new(clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = Scheduler::new(store.clone(), transport.clone(), SchedulerConfig::default())
            .with_clock(clock.clone());

        let mut zero = job(&clock, "/zero", 0, 0);
        zero.claim(clock.now());
        let zero_code = store.enqueue(zero.clone()).await.unwrap();
        store.forced.lock().unwrap().push(zero);
        let normal = store.enqueue(job(&clock, "/normal", 1, 0)).await.unwrap();

        let report = scheduler.run_cycle().await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.released, 2);
        assert_eq!(transport.calls("/zero"), 0);
        assert!(store.list_outputs(&zero_code).await.unwrap().is_empty());

        let zero = store.get_job(&zero_code).await.unwrap().unwrap();
        assert!(!zero.is_processing);
        assert_eq!(zero.tried_counts, 0);
        assert!(store.get_job(&normal).await.unwrap().unwrap().is_successful);
    }

    #[tokio::test]
    async fn claims_are_released_when_persistence_fails() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::new(clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = Scheduler::new(store.clone(), transport.clone(), SchedulerConfig::default())
            .with_clock(clock.clone());
        let code = store.enqueue(job(&clock, "/p", 2, 0)).await.unwrap();

        store.fail_persist.store(true, Ordering::SeqCst);
        let report = scheduler.run_cycle().await.unwrap();

        assert_eq!(report.persist_errors, 1);
        assert_eq!(report.released, 1);
        let stored = store.get_job(&code).await.unwrap().unwrap();
        assert!(!stored.is_processing);
        assert_eq!(stored.tried_counts, 0);
        assert_eq!(scheduler.stats().persist_errors, 1);

        // Delivered again next cycle: at-least-once.
        store.fail_persist.store(false, Ordering::SeqCst);
        scheduler.run_cycle().await.unwrap();
        assert_eq!(transport.calls("/p"), 2);
        assert!(store.get_job(&code).await.unwrap().unwrap().is_successful);
    }

    #[tokio::test]
    async fn failed_release_is_retried_before_the_next_poll() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::new(clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("/r", &[Reply::Status(500), Reply::Status(200)]);
        let scheduler = Scheduler::new(store.clone(), transport.clone(), SchedulerConfig::default())
            .with_clock(clock.clone());
        let code = store.enqueue(job(&clock, "/r", 2, 0)).await.unwrap();

        store.failing_releases.store(2, Ordering::SeqCst);
        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Release { count: 1, .. }));
        assert_eq!(scheduler.pending_releases(), 1);
        let stored = store.get_job(&code).await.unwrap().unwrap();
        assert!(stored.is_processing);
        assert_eq!(stored.tried_counts, 1);

        // The leftover release fails again; the job stays claimed and queued.
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(report.released_late, 0);
        assert_eq!(scheduler.pending_releases(), 1);

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.released_late, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(scheduler.pending_releases(), 0);

        let stored = store.get_job(&code).await.unwrap().unwrap();
        assert!(stored.is_successful);
        assert!(!stored.is_processing);
        assert_eq!(transport.calls("/r"), 2);
        assert_eq!(scheduler.stats().release_errors, 2);
    }

    #[tokio::test]
    async fn claim_failure_aborts_only_the_cycle() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(FlakyStore::new(clock.clone()));
        let transport = Arc::new(ScriptedTransport::default());
        let scheduler = Scheduler::new(store.clone(), transport.clone(), SchedulerConfig::default())
            .with_clock(clock.clone());
        let code = store.enqueue(job(&clock, "/x", 1, 0)).await.unwrap();

        store.fail_claim.store(true, Ordering::SeqCst);
        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Claim(TaskStoreError::Transaction(_))));
        assert_eq!(transport.calls("/x"), 0);
        assert!(!store.get_job(&code).await.unwrap().unwrap().is_processing);

        store.fail_claim.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.run_cycle().await.unwrap().succeeded, 1);
        assert_eq!(scheduler.stats().claim_errors, 1);
    }

    #[tokio::test]
    async fn batches_bound_concurrency_within_one_cycle() {
        let h = harness(SchedulerConfig::default().with_batch_size(3));
        for i in 0..10 {
            h.store
                .enqueue(job(&h.clock, &format!("/batch/{i}"), 1, 0))
                .await
                .unwrap();
        }

        let report = h.scheduler.run_cycle().await.unwrap();

        assert_eq!(report.claimed, 10);
        assert_eq!(report.succeeded, 10);
        assert_eq!(report.released, 10);
        assert!(h.transport.max_in_flight() <= 3);
    }

    #[tokio::test]
    async fn page_size_limits_claims_per_cycle() {
        let h = harness(SchedulerConfig::default().with_page_size(4));
        for i in 0..10 {
            h.store
                .enqueue(job(&h.clock, &format!("/page/{i}"), 1, 0))
                .await
                .unwrap();
        }

        assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 4);
        assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 4);
        assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 2);
        assert_eq!(h.scheduler.run_cycle().await.unwrap().claimed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_job() {
        let store = InMemoryTaskStore::arc();
        let now = Utc::now();
        for _ in 0..200 {
            store
                .enqueue(Job::new(QueueId::new(), "c", "/c", now))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let claimed = store.claim_due_jobs(7, 0).await.unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    mine.extend(claimed.into_iter().map(|j| j.code));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for code in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(code), "job claimed twice");
            }
        }
        assert_eq!(total, 200);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_sleep() {
        let h = harness(SchedulerConfig::default().with_poll_interval(StdDuration::from_secs(3600)));
        let initial_stats = h.scheduler.stats();
        assert_eq!(initial_stats.cycles, 0);

        let handle = h.scheduler.spawn();
        for _ in 0..100 {
            if handle.stats().cycles >= 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().cycles, 1);

        tokio::time::timeout(StdDuration::from_secs(2), handle.shutdown())
            .await
            .expect("scheduler did not stop promptly");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: a claim returns exactly the eligible jobs.
        #[test]
        fn claim_selects_only_eligible_jobs(
            specs in prop::collection::vec(
                (0u32..4, 0u32..4, any::<bool>(), any::<bool>(), -120i64..120),
                0..40,
            )
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let clock = Arc::new(ManualClock::new(Utc::now()));
                let store = InMemoryTaskStore::with_clock(clock.clone());
                let now = clock.now();

                let mut expected = HashSet::new();
                for (retries, tried, processing, successful, offset) in specs {
                    let mut j = Job::new(QueueId::new(), "p", "/p", now);
                    j.retries = retries;
                    j.tried_counts = tried;
                    j.is_processing = processing;
                    j.is_successful = successful;
                    j.next_execution = now + Duration::seconds(offset);
                    if j.is_eligible(now) {
                        expected.insert(j.code.clone());
                    }
                    store.enqueue(j).await.unwrap();
                }

                let claimed: HashSet<Code> = store
                    .claim_due_jobs(usize::MAX, 0)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|j| j.code)
                    .collect();

                prop_assert_eq!(claimed, expected);
                Ok(())
            })?;
        }
    }
}
