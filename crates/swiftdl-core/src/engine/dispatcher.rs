//! Priority dispatcher - three FIFO bands feeding the worker pool
//!
//! Workers scan high, normal, then low. Every `fairness_interval`-th
//! dequeue scans low first, so a busy high band slows the low band down
//! without starving it. When every band is empty a worker sleeps with an
//! escalating timeout (the per-band waits, then the idle wait); a push
//! wakes it immediately.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use swiftdl_types::{PriorityBand, QueueDepth};
use tokio::sync::Notify;

const PREFERRED: [PriorityBand; 3] = PriorityBand::ALL;
const FAIR_TURN: [PriorityBand; 3] = [PriorityBand::Low, PriorityBand::Normal, PriorityBand::High];

struct Bands<T> {
    queues: [VecDeque<T>; 3],
    dequeues: u64,
}

pub struct PriorityDispatcher<T> {
    bands: Mutex<Bands<T>>,
    notify: Notify,
    closed: AtomicBool,
    band_waits: [Duration; 3],
    idle_wait: Duration,
    fairness_interval: u32,
}

impl<T> PriorityDispatcher<T> {
    pub fn new(band_waits: [Duration; 3], idle_wait: Duration, fairness_interval: u32) -> Self {
        Self {
            bands: Mutex::new(Bands {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                dequeues: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            band_waits,
            idle_wait,
            fairness_interval,
        }
    }

    /// Append to the back of `band`
    pub fn push(&self, band: PriorityBand, item: T) {
        self.bands.lock().queues[band.index()].push_back(item);
        self.notify.notify_waiters();
    }

    /// Take the next item without waiting
    pub fn try_next(&self) -> Option<T> {
        let mut bands = self.bands.lock();
        let turn = bands.dequeues + 1;
        let order = if self.fairness_interval > 0 && turn % u64::from(self.fairness_interval) == 0 {
            &FAIR_TURN
        } else {
            &PREFERRED
        };

        for band in order {
            if let Some(item) = bands.queues[band.index()].pop_front() {
                bands.dequeues = turn;
                return Some(item);
            }
        }
        None
    }

    /// Wait for the next item. Returns `None` once the dispatcher is closed.
    pub async fn next(&self) -> Option<T> {
        let mut waits = self
            .band_waits
            .iter()
            .copied()
            .chain(std::iter::repeat(self.idle_wait));

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent push cannot be missed
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.try_next() {
                return Some(item);
            }

            let wait = waits.next().unwrap_or(self.idle_wait);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    pub fn depths(&self) -> QueueDepth {
        let bands = self.bands.lock();
        QueueDepth {
            high: bands.queues[PriorityBand::High.index()].len(),
            normal: bands.queues[PriorityBand::Normal.index()].len(),
            low: bands.queues[PriorityBand::Low.index()].len(),
        }
    }

    pub fn len(&self) -> usize {
        self.depths().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and wake every waiting worker
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Accept items again after a close
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove everything still queued, high band first
    pub fn drain(&self) -> Vec<T> {
        let mut bands = self.bands.lock();
        bands.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn dispatcher(fairness_interval: u32) -> PriorityDispatcher<u32> {
        PriorityDispatcher::new(
            [Duration::from_millis(5), Duration::from_millis(10), Duration::from_millis(20)],
            Duration::from_millis(50),
            fairness_interval,
        )
    }

    #[test]
    fn test_fifo_within_band() {
        let d = dispatcher(0);
        for i in 0..5 {
            d.push(PriorityBand::Normal, i);
        }
        let order: Vec<u32> = std::iter::from_fn(|| d.try_next()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_higher_bands_preferred() {
        let d = dispatcher(0);
        d.push(PriorityBand::Low, 3);
        d.push(PriorityBand::Normal, 2);
        d.push(PriorityBand::High, 1);
        assert_eq!(d.try_next(), Some(1));
        assert_eq!(d.try_next(), Some(2));
        assert_eq!(d.try_next(), Some(3));
        assert_eq!(d.try_next(), None);
    }

    #[test]
    fn test_low_band_not_starved() {
        let d = dispatcher(8);
        for i in 0..20 {
            d.push(PriorityBand::High, i);
        }
        d.push(PriorityBand::Low, 100);

        let first_eight: Vec<u32> = (0..8).filter_map(|_| d.try_next()).collect();
        assert_eq!(first_eight.len(), 8);
        assert_eq!(first_eight[7], 100);
        assert!(first_eight[..7].iter().all(|v| *v < 100));
        assert_eq!(d.depths().high, 13);
    }

    #[test]
    fn test_depths_and_drain() {
        let d = dispatcher(8);
        d.push(PriorityBand::High, 1);
        d.push(PriorityBand::Low, 2);
        d.push(PriorityBand::Low, 3);
        assert_eq!(
            d.depths(),
            QueueDepth {
                high: 1,
                normal: 0,
                low: 2
            }
        );
        assert_eq!(d.drain(), vec![1, 2, 3]);
        assert!(d.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_waiting_worker() {
        let d = Arc::new(PriorityDispatcher::new(
            [Duration::from_secs(5); 3],
            Duration::from_secs(5),
            8,
        ));
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        d.push(PriorityBand::Low, 7);
        assert_eq!(waiter.await.unwrap(), Some(7));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let d = Arc::new(dispatcher(8));
        let waiter = {
            let d = d.clone();
            tokio::spawn(async move { d.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        d.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
