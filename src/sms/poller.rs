//! SMS poller: fetches the inbox on a fixed period and delivers each new,
//! fresh message to the registered handler exactly once.
//!
//! Per tick:
//! 1. Fetch the inbox snapshot (abort the tick on error, nothing mutated)
//! 2. Skip ids already in the dedup store
//! 3. Record the id as seen *before* validating it
//! 4. Drop messages with an unparseable timestamp or older than the alive time
//! 5. Await the handler; its errors and panics stay inside the tick
//!
//! Ticks are single-flight: the spawned loop runs them sequentially and
//! `poll_once()` refuses to overlap a tick that is still running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollerConfig;
use crate::error::StoreError;
use crate::sms::dedup::DedupStore;
use crate::sms::source::{MessageSource, SmsHandler};
use crate::sms::types::Sms;

/// Source of "now" for the staleness check.
pub trait Clock: Send + Sync {
    /// Current wall time, comparable with device-local timestamps.
    fn now(&self) -> NaiveDateTime;
}

/// Host local time. The modem stamps messages in its own local time, which
/// matches the host when both share a timezone setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Per-tick counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Messages in the fetched snapshot.
    pub fetched: usize,
    /// Already seen on an earlier tick or earlier in this snapshot.
    pub duplicate: usize,
    /// New, but with an unparseable timestamp.
    pub invalid: usize,
    /// New, but older than the alive time.
    pub stale: usize,
    /// Handed to the handler.
    pub delivered: usize,
    /// Deliveries where the handler returned an error or panicked.
    pub handler_failed: usize,
}

/// Result of one `poll_once()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(PollStats),
    /// The inbox could not be fetched; nothing was recorded.
    FetchFailed,
    /// A previous tick was still running.
    Busy,
}

/// The polling engine.
pub struct SmsPoller {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn SmsHandler>,
    clock: Arc<dyn Clock>,
    /// Also the single-flight guard: a tick holds it from fetch to last delivery.
    store: Mutex<DedupStore>,
    alive_ms: i64,
    interval: Duration,
}

impl SmsPoller {
    pub fn new(
        config: &PollerConfig,
        store: DedupStore,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn SmsHandler>,
    ) -> Self {
        Self {
            source,
            handler,
            clock: Arc::new(SystemClock),
            store: Mutex::new(store),
            alive_ms: i64::try_from(config.sms_alive_time.as_millis()).unwrap_or(i64::MAX),
            interval: config.poll_interval,
        }
    }

    /// Replace the wall clock, mainly for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `id` has been recorded as seen.
    pub async fn is_seen(&self, id: i64) -> bool {
        self.store.lock().await.contains(id)
    }

    /// Snapshot of the seen identifiers, in insertion order.
    pub async fn seen_ids(&self) -> Vec<i64> {
        self.store.lock().await.ids().to_vec()
    }

    /// Persist the dedup store now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.store.lock().await.flush().await
    }

    /// Run a single poll cycle.
    pub async fn poll_once(&self) -> TickOutcome {
        let Ok(mut store) = self.store.try_lock() else {
            warn!("Previous SMS poll still running, skipping tick");
            return TickOutcome::Busy;
        };

        let inbox = match self.source.fetch_inbox().await {
            Ok(inbox) => inbox,
            Err(e) => {
                error!("SMS inbox fetch failed: {e}");
                return TickOutcome::FetchFailed;
            }
        };

        let mut stats = PollStats {
            fetched: inbox.len(),
            ..PollStats::default()
        };

        for message in inbox {
            if !store.append(message.index) {
                stats.duplicate += 1;
                continue;
            }

            info!(
                id = message.index,
                phone = %message.phone,
                date = %message.date,
                "New SMS"
            );

            let date = match message.parse_date() {
                Ok(date) => date,
                Err(e) => {
                    warn!(id = message.index, date = %message.date, "Dropping SMS with bad timestamp: {e}");
                    stats.invalid += 1;
                    continue;
                }
            };

            let age = self.clock.now() - date;
            if age.num_milliseconds() > self.alive_ms {
                info!(id = message.index, age_secs = age.num_seconds(), "SMS is too old, skipping");
                stats.stale += 1;
                continue;
            }

            let sms = Sms {
                id: message.index,
                date,
                phone: message.phone,
                content: message.content,
            };

            stats.delivered += 1;
            match AssertUnwindSafe(self.handler.on_sms(sms)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    stats.handler_failed += 1;
                    error!(id = message.index, "SMS handler failed: {e}");
                }
                Err(_) => {
                    stats.handler_failed += 1;
                    error!(id = message.index, "SMS handler panicked");
                }
            }
        }

        if stats.fetched > stats.duplicate {
            debug!(?stats, "SMS poll finished");
        }

        TickOutcome::Completed(stats)
    }

    /// Spawn the poll loop.
    ///
    /// The loop stops when `cancel` fires. A tick already in progress runs to
    /// completion, then the dedup store is flushed before the task exits.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.interval.as_millis() as u64,
                alive_ms = self.alive_ms,
                "SMS poller started"
            );

            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                self.poll_once().await;
            }

            info!("SMS poller shutting down");
            if let Err(e) = self.flush().await {
                error!("Failed to flush dedup store on shutdown: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::{Error, GatekeeperError, ModemError};
    use crate::sms::types::{DEVICE_DATE_FORMAT, InboxMessage};

    /// Replays queued responses, repeating the last one once the queue drains.
    struct ScriptedSource {
        script: StdMutex<VecDeque<Result<Vec<InboxMessage>, ModemError>>>,
        last: StdMutex<Vec<InboxMessage>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<InboxMessage>, ModemError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                last: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn fetch_inbox(&self) -> Result<Vec<InboxMessage>, ModemError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(inbox)) => {
                    *self.last.lock().unwrap() = inbox.clone();
                    Ok(inbox)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        received: StdMutex<Vec<Sms>>,
    }

    impl Recorder {
        fn ids(&self) -> Vec<i64> {
            self.received.lock().unwrap().iter().map(|s| s.id).collect()
        }
    }

    #[async_trait]
    impl SmsHandler for Recorder {
        async fn on_sms(&self, sms: Sms) -> Result<(), Error> {
            self.received.lock().unwrap().push(sms);
            Ok(())
        }
    }

    /// Fails on even ids, panics on id 13.
    #[derive(Default)]
    struct Flaky {
        calls: StdMutex<Vec<i64>>,
    }

    #[async_trait]
    impl SmsHandler for Flaky {
        async fn on_sms(&self, sms: Sms) -> Result<(), Error> {
            self.calls.lock().unwrap().push(sms.id);
            if sms.id == 13 {
                panic!("handler blew up");
            }
            if sms.id % 2 == 0 {
                return Err(GatekeeperError::NotConfirmed.into());
            }
            Ok(())
        }
    }

    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn sms_at(id: i64, age_secs: i64, content: &str) -> InboxMessage {
        InboxMessage {
            index: id,
            phone: "+79990001122".into(),
            content: content.into(),
            date: (now() - TimeDelta::seconds(age_secs))
                .format(DEVICE_DATE_FORMAT)
                .to_string(),
        }
    }

    fn config(dir: &TempDir) -> PollerConfig {
        PollerConfig {
            last_sms_file: dir.path().join("last_sms.json"),
            sms_alive_time: Duration::from_secs(300),
            poll_interval: Duration::from_millis(20),
        }
    }

    async fn poller(
        dir: &TempDir,
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn SmsHandler>,
    ) -> SmsPoller {
        let config = config(dir);
        let store = DedupStore::load(&config.last_sms_file).await.unwrap();
        SmsPoller::new(&config, store, source, handler).with_clock(Arc::new(FixedClock(now())))
    }

    fn stats(outcome: TickOutcome) -> PollStats {
        match outcome {
            TickOutcome::Completed(stats) => stats,
            other => panic!("expected completed tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_message_is_delivered_once() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![sms_at(5, 2, "domofon SECRET123")])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        let first = stats(poller.poll_once().await);
        assert_eq!(first.delivered, 1);
        assert_eq!(recorder.ids(), vec![5]);

        let delivered = recorder.received.lock().unwrap()[0].clone();
        assert_eq!(delivered.content, "domofon SECRET123");
        assert_eq!(delivered.phone, "+79990001122");
        assert_eq!(delivered.date, now() - TimeDelta::seconds(2));

        // Device still lists the message on the next tick.
        let second = stats(poller.poll_once().await);
        assert_eq!(second.duplicate, 1);
        assert_eq!(second.delivered, 0);
        assert_eq!(recorder.ids(), vec![5]);
        assert_eq!(poller.seen_ids().await, vec![5]);
    }

    #[tokio::test]
    async fn stale_message_is_recorded_but_not_delivered() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![sms_at(7, 10_000, "domofon SECRET123")])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.delivered, 0);
        assert!(recorder.ids().is_empty());
        assert!(poller.is_seen(7).await);
    }

    #[tokio::test]
    async fn alive_time_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![
            sms_at(1, 300, "exactly at the limit"),
            sms_at(2, 301, "one second over"),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(recorder.ids(), vec![1]);
    }

    #[tokio::test]
    async fn bad_timestamp_is_recorded_and_processing_continues() {
        let dir = TempDir::new().unwrap();
        let mut broken = sms_at(3, 0, "domofon");
        broken.date = "yesterday".into();
        let source = ScriptedSource::new(vec![Ok(vec![broken, sms_at(4, 1, "domofon")])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(recorder.ids(), vec![4]);
        assert!(poller.is_seen(3).await);

        // Never retried.
        poller.poll_once().await;
        assert_eq!(recorder.ids(), vec![4]);
    }

    #[tokio::test]
    async fn fetch_error_mutates_nothing_and_next_tick_recovers() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![
            Err(ModemError::Request {
                endpoint: "/api/sms/sms-list".into(),
                reason: "connection refused".into(),
            }),
            Ok(vec![sms_at(9, 5, "domofon")]),
        ]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        assert_eq!(poller.poll_once().await, TickOutcome::FetchFailed);
        assert!(poller.seen_ids().await.is_empty());
        assert!(recorder.ids().is_empty());

        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.delivered, 1);
        assert_eq!(recorder.ids(), vec![9]);
    }

    #[tokio::test]
    async fn duplicates_within_one_snapshot_are_collapsed() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![
            sms_at(11, 1, "first copy"),
            sms_at(11, 1, "second copy"),
            sms_at(12, 1, "other"),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.fetched, 3);
        assert_eq!(stats.duplicate, 1);
        assert_eq!(recorder.ids(), vec![11, 12]);
        assert_eq!(recorder.received.lock().unwrap()[0].content, "first copy");
    }

    #[tokio::test]
    async fn delivery_follows_source_order() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![
            sms_at(40003, 1, "c"),
            sms_at(40001, 1, "a"),
            sms_at(40002, 1, "b"),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, source, recorder.clone()).await;

        poller.poll_once().await;
        assert_eq!(recorder.ids(), vec![40003, 40001, 40002]);
        assert_eq!(poller.seen_ids().await, vec![40003, 40001, 40002]);
    }

    #[tokio::test]
    async fn handler_failures_do_not_stop_the_tick() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![
            Ok(vec![sms_at(2, 1, "x"), sms_at(13, 1, "x"), sms_at(15, 1, "x")]),
            Ok(vec![sms_at(17, 1, "x")]),
        ]);
        let flaky = Arc::new(Flaky::default());
        let poller = poller(&dir, source, flaky.clone()).await;

        let first = stats(poller.poll_once().await);
        assert_eq!(first.delivered, 3);
        assert_eq!(first.handler_failed, 2);

        let second = stats(poller.poll_once().await);
        assert_eq!(second.delivered, 1);
        assert_eq!(second.handler_failed, 0);
        assert_eq!(*flaky.calls.lock().unwrap(), vec![2, 13, 15, 17]);
    }

    #[tokio::test]
    async fn seen_ids_survive_restart() {
        let dir = TempDir::new().unwrap();
        let snapshot = vec![sms_at(21, 1, "domofon")];

        {
            let recorder = Arc::new(Recorder::default());
            let poller = poller(&dir, ScriptedSource::new(vec![Ok(snapshot.clone())]), recorder.clone()).await;
            poller.poll_once().await;
            poller.flush().await.unwrap();
            assert_eq!(recorder.ids(), vec![21]);
        }

        let recorder = Arc::new(Recorder::default());
        let poller = poller(&dir, ScriptedSource::new(vec![Ok(snapshot)]), recorder.clone()).await;
        let stats = stats(poller.poll_once().await);
        assert_eq!(stats.duplicate, 1);
        assert!(recorder.ids().is_empty());
    }

    #[tokio::test]
    async fn unwritable_store_still_dedups() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("sub");
        let config = PollerConfig {
            last_sms_file: blocker.join("last_sms.json"),
            ..config(&dir)
        };
        let store = DedupStore::load(&config.last_sms_file).await.unwrap();
        tokio::fs::write(&blocker, "not a directory").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let source = ScriptedSource::new(vec![Ok(vec![sms_at(5, 2, "domofon SECRET123")])]);
        let poller = SmsPoller::new(&config, store, source, recorder.clone())
            .with_clock(Arc::new(FixedClock(now())));

        let first = stats(poller.poll_once().await);
        assert_eq!(first.delivered, 1);
        assert!(poller.flush().await.is_err());

        let second = stats(poller.poll_once().await);
        assert_eq!(second.duplicate, 1);
        assert_eq!(second.delivered, 0);
        assert_eq!(recorder.ids(), vec![5]);
        assert!(poller.is_seen(5).await);
    }

    /// Blocks inside the handler until released.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SmsHandler for Gate {
        async fn on_sms(&self, _sms: Sms) -> Result<(), Error> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![Ok(vec![sms_at(31, 1, "slow")])]);
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let poller = Arc::new(poller(&dir, source, gate.clone()).await);

        let first = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.poll_once().await }
        });
        gate.entered.notified().await;

        assert_eq!(poller.poll_once().await, TickOutcome::Busy);

        gate.release.notify_one();
        let first = stats(first.await.unwrap());
        assert_eq!(first.delivered, 1);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel_and_flushes() {
        let dir = TempDir::new().unwrap();
        let path = config(&dir).last_sms_file;
        let source = ScriptedSource::new(vec![Ok(vec![sms_at(41, 1, "domofon"), sms_at(42, 9_999, "old")])]);
        let recorder = Arc::new(Recorder::default());
        let poller = Arc::new(poller(&dir, source, recorder.clone()).await);

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&poller).spawn(cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("poller never delivered");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller did not stop")
            .unwrap();

        // Many ticks ran, one delivery.
        assert_eq!(recorder.ids(), vec![41]);

        let persisted: Vec<i64> = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(persisted, vec![41, 42]);
    }
}
