//! Ledger event watcher
//!
//! Two producers feed one channel of [`GameEvent`]s:
//! - the subscription producer streams live logs and backfills from the
//!   cursor to head every time it (re)subscribes
//! - the polling producer scans `get_logs` ranges, but only while the
//!   subscription is down
//!
//! Both share one `(block, log_index)` cursor and an event is forwarded only
//! if it lies strictly after it, so overlapping producers never emit twice.

use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::chain::LogSource;
use crate::config::WatcherConfig;
use crate::coordination::ShutdownSignal;
use crate::domain::GameEvent;
use crate::error::{AgentError, Result};

/// Position of the last forwarded event. `log_index == u64::MAX` marks a
/// block that was scanned completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub block: u64,
    pub log_index: u64,
}

impl Cursor {
    pub fn through(block: u64) -> Self {
        Self {
            block,
            log_index: u64::MAX,
        }
    }

    pub fn of(event: &GameEvent) -> Self {
        Self {
            block: event.block,
            log_index: event.log_index,
        }
    }

    /// First block that may still hold unseen events.
    pub fn next_block(&self) -> u64 {
        if self.log_index == u64::MAX {
            self.block + 1
        } else {
            self.block
        }
    }
}

pub struct EventWatcher {
    source: Arc<dyn LogSource>,
    config: WatcherConfig,
    /// Whether the source can stream at all (a WebSocket URL is configured)
    live: bool,
    tx: mpsc::Sender<GameEvent>,
    cursor: Mutex<Option<Cursor>>,
    subscribed: watch::Sender<bool>,
}

impl EventWatcher {
    pub fn new(
        source: Arc<dyn LogSource>,
        config: WatcherConfig,
        live: bool,
        tx: mpsc::Sender<GameEvent>,
    ) -> Self {
        let (subscribed, _) = watch::channel(false);
        Self {
            source,
            config,
            live,
            tx,
            cursor: Mutex::new(None),
            subscribed,
        }
    }

    pub async fn cursor(&self) -> Option<Cursor> {
        *self.cursor.lock().await
    }

    /// Place the cursor before `start_block`, or at head when none is set.
    async fn init_cursor(&self) -> Result<()> {
        let mut cursor = self.cursor.lock().await;
        if cursor.is_some() {
            return Ok(());
        }
        let start = match self.config.start_block {
            Some(block) => Cursor::through(block.saturating_sub(1)),
            None => Cursor::through(self.source.head().await?),
        };
        info!("Watching events after block {}", start.block);
        *cursor = Some(start);
        Ok(())
    }

    /// Forward `event` unless it is at or before the cursor.
    async fn emit(&self, event: GameEvent) -> Result<bool> {
        let mut cursor = self.cursor.lock().await;
        let position = Cursor::of(&event);
        if cursor.is_some_and(|c| position <= c) {
            return Ok(false);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| AgentError::Internal("event channel closed".into()))?;
        *cursor = Some(position);
        Ok(true)
    }

    async fn mark_scanned(&self, block: u64) {
        let mut cursor = self.cursor.lock().await;
        let scanned = Cursor::through(block);
        if cursor.map_or(true, |c| scanned > c) {
            *cursor = Some(scanned);
        }
    }

    /// Fetch everything between the cursor and head in bounded chunks.
    pub async fn backfill(&self) -> Result<usize> {
        let head = self.source.head().await?;
        let mut from = match self.cursor().await {
            Some(c) => c.next_block(),
            None => head,
        };
        let span = self.config.max_block_range.max(1);
        let mut forwarded = 0;

        while from <= head {
            let to = head.min(from.saturating_add(span - 1));
            for event in self.source.events_between(from, to).await? {
                if self.emit(event).await? {
                    forwarded += 1;
                }
            }
            self.mark_scanned(to).await;
            from = to + 1;
        }
        if forwarded > 0 {
            debug!("Backfilled {} events up to block {}", forwarded, head);
        }
        Ok(forwarded)
    }

    /// Run both producers until shutdown.
    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<ShutdownSignal>) -> Result<()> {
        self.init_cursor().await?;
        let poller = {
            let watcher = self.clone();
            let shutdown = shutdown_rx.resubscribe();
            async move { watcher.poll_loop(shutdown).await }
        };
        if self.live {
            tokio::join!(self.subscription_loop(shutdown_rx), poller);
        } else {
            info!("No subscription endpoint, polling only");
            poller.await;
        }
        info!("event watcher stopped");
        Ok(())
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.reconnect_delay_ms);
        let delay = (base * attempt.clamp(1, 10)).min(Duration::from_secs(60));

        // Up to 25% jitter
        let jitter_range = delay.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_range))
        } else {
            Duration::ZERO
        };
        delay + jitter
    }

    async fn subscription_loop(&self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        let mut attempt: u32 = 0;
        loop {
            match self.source.subscribe().await {
                Ok(mut stream) => {
                    attempt = 0;
                    self.subscribed.send_replace(true);
                    if let Err(e) = self.backfill().await {
                        warn!("Backfill after subscribe failed: {}", e);
                    }

                    loop {
                        tokio::select! {
                            next = stream.next() => match next {
                                Some(event) => {
                                    if let Err(e) = self.emit(event).await {
                                        error!("Dropping watcher: {}", e);
                                        self.subscribed.send_replace(false);
                                        return;
                                    }
                                }
                                None => break,
                            },
                            _ = shutdown_rx.recv() => {
                                self.subscribed.send_replace(false);
                                return;
                            }
                        }
                    }

                    self.subscribed.send_replace(false);
                    info!("Log subscription ended, resubscribing...");
                }
                Err(e) => {
                    self.subscribed.send_replace(false);
                    attempt = attempt.saturating_add(1);
                    let delay = self.reconnect_delay(attempt);
                    warn!(
                        "Log subscription failed (attempt {}): {}. Retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
        }
    }

    async fn poll_loop(&self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *self.subscribed.borrow() {
                        continue;
                    }
                    match self.backfill().await {
                        Ok(_) => {}
                        Err(AgentError::Internal(e)) => {
                            error!("Stopping poller: {}", e);
                            return;
                        }
                        Err(e) => warn!("Log poll failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GameEventKind;
    use crate::testing::FakeLogSource;

    fn event(block: u64, log_index: u64) -> GameEvent {
        GameEvent {
            game_id: block,
            kind: GameEventKind::GameUpdated,
            block,
            log_index,
        }
    }

    fn config(start_block: Option<u64>) -> WatcherConfig {
        WatcherConfig {
            poll_interval_ms: 10,
            max_block_range: 10,
            reconnect_delay_ms: 10,
            start_block,
            ..WatcherConfig::default()
        }
    }

    #[test]
    fn test_cursor_ordering() {
        assert!(Cursor::through(5) > Cursor::of(&event(5, 9)));
        assert!(Cursor::of(&event(6, 0)) > Cursor::through(5));
        assert_eq!(Cursor::through(5).next_block(), 6);
        assert_eq!(Cursor::of(&event(5, 2)).next_block(), 5);
    }

    #[tokio::test]
    async fn test_emit_only_after_cursor() {
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = EventWatcher::new(Arc::new(FakeLogSource::default()), config(None), false, tx);

        assert!(watcher.emit(event(4, 1)).await.unwrap());
        assert!(!watcher.emit(event(4, 1)).await.unwrap());
        assert!(!watcher.emit(event(4, 0)).await.unwrap());
        assert!(watcher.emit(event(4, 2)).await.unwrap());

        assert_eq!(rx.recv().await.unwrap().log_index, 1);
        assert_eq!(rx.recv().await.unwrap().log_index, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backfill_in_chunks_up_to_head() {
        let source = FakeLogSource::default();
        *source.head.lock().unwrap() = 25;
        *source.events.lock().unwrap() = vec![event(5, 0), event(12, 3), event(25, 0), event(26, 0)];
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = EventWatcher::new(Arc::new(source), config(Some(1)), false, tx);
        watcher.init_cursor().await.unwrap();

        assert_eq!(watcher.backfill().await.unwrap(), 3);
        assert_eq!(watcher.cursor().await, Some(Cursor::through(25)));
        let blocks: Vec<u64> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.block)
        .collect();
        assert_eq!(blocks, vec![5, 12, 25]);

        // Nothing new below head
        assert_eq!(watcher.backfill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_backfills_without_duplicates() {
        let source = FakeLogSource::default();
        *source.head.lock().unwrap() = 10;
        *source.events.lock().unwrap() = vec![event(3, 0), event(7, 1)];
        // The live stream replays an event already covered by the backfill
        *source.live.lock().unwrap() = vec![vec![event(7, 1), event(11, 0)]];

        let (tx, mut rx) = mpsc::channel(16);
        let watcher = Arc::new(EventWatcher::new(Arc::new(source), config(Some(0)), true, tx));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(watcher.clone().run(shutdown_rx));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push((ev.block, ev.log_index));
        }
        assert_eq!(seen, vec![(3, 0), (7, 1), (11, 0)]);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        task.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_polling_only_when_not_live() {
        let source = Arc::new(FakeLogSource::default());
        *source.head.lock().unwrap() = 4;
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = Arc::new(EventWatcher::new(source.clone(), config(None), false, tx));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(watcher.clone().run(shutdown_rx));

        // Cursor starts at head; later blocks are picked up by the poller
        tokio::time::sleep(Duration::from_millis(30)).await;
        *source.events.lock().unwrap() = vec![event(2, 0), event(6, 0)];
        *source.head.lock().unwrap() = 6;

        let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.block, 6);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        task.await.unwrap().unwrap();
    }
}
