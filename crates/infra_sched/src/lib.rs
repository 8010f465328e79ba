//! Fixed-cadence background work. A schedule yields wall-clock fire times;
//! `periodic` runs a closure at those times on a detached task until the
//! returned handle is cancelled or dropped.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

pub trait Schedule: Send + 'static {
    /// Next fire time, or `None` to stop the loop.
    fn next(&mut self) -> Option<DateTime<Utc>>;
}

/// Fires every `period`. The first tick is truncated to the period boundary
/// so ticks land on a predictable wall-clock grid.
pub struct Every {
    period: Duration,
    last: Option<DateTime<Utc>>,
}

impl Every {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// Shifts every fire time by an offset of day, e.g. `"06:30"` or a
    /// duration string such as `"45m"`.
    pub fn at(self, offset: &str) -> Option<At> {
        let offset = parse_offset(offset)?;
        Some(At {
            parent: Box::new(self),
            offset,
        })
    }
}

impl Schedule for Every {
    fn next(&mut self) -> Option<DateTime<Utc>> {
        let period_ms = self.period.as_millis() as i64;
        let t = match self.last {
            Some(last) => last,
            None => {
                let now = Utc::now().timestamp_millis();
                DateTime::from_timestamp_millis(now - now.rem_euclid(period_ms))?
            }
        };

        let next = t + chrono::Duration::milliseconds(period_ms);
        self.last = Some(next);
        Some(next)
    }
}

pub struct At {
    parent: Box<dyn Schedule>,
    offset: Duration,
}

impl Schedule for At {
    fn next(&mut self) -> Option<DateTime<Utc>> {
        let t = self.parent.next()?;
        Some(t + chrono::Duration::from_std(self.offset).ok()?)
    }
}

fn parse_offset(text: &str) -> Option<Duration> {
    // HH:MM form.
    if text.len() == 5 && text.as_bytes()[2] == b':' {
        let hours: u64 = text[..2].parse().ok()?;
        let minutes: u64 = text[3..].parse().ok()?;
        return Some(Duration::from_secs(hours * 3600 + minutes * 60));
    }

    // Single-unit duration form: "45m", "30s", "2h".
    let (value, unit) = text.split_at(text.len().checked_sub(1)?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Cancellation handle for a periodic task. Cancelling (or dropping) the
/// handle stops the loop within one cadence; the work function is never
/// interrupted mid-run.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Runs `work` at the times produced by `schedule`. The work function runs
/// at most once per cadence and never concurrently with itself.
pub fn periodic<S, W, F>(mut schedule: S, mut work: W) -> CancelHandle
where
    S: Schedule,
    W: FnMut() -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            let Some(t) = schedule.next() else {
                return;
            };

            let wait = (t - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = rx.changed() => return,
            }

            work().await;
        }
    });

    CancelHandle { tx }
}

/// Fixed-interval variant without grid alignment; first run after `period`.
pub fn tick<W, F>(period: Duration, mut work: W) -> CancelHandle
where
    W: FnMut() -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => work().await,
                _ = rx.changed() => return,
            }
        }
    });

    CancelHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn every_lands_on_the_period_grid() {
        let mut schedule = Every::new(Duration::from_secs(60));
        let first = schedule.next().expect("first tick");
        assert_eq!(first.timestamp() % 60, 0);

        let second = schedule.next().expect("second tick");
        assert_eq!((second - first).num_seconds(), 60);
    }

    #[test]
    fn at_shifts_the_grid() {
        let mut plain = Every::new(Duration::from_secs(3600));
        let mut shifted = Every::new(Duration::from_secs(3600)).at("00:30").expect("offset");
        let base = plain.next().unwrap();
        let offset = shifted.next().unwrap();
        assert_eq!((offset - base).num_seconds(), 1800);
    }

    #[test]
    fn parse_offset_forms() {
        assert_eq!(parse_offset("06:30"), Some(Duration::from_secs(6 * 3600 + 1800)));
        assert_eq!(parse_offset("45m"), Some(Duration::from_secs(2700)));
        assert_eq!(parse_offset("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_offset("bogus"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_and_stops_on_cancel() {
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = runs.clone();
        let handle = tick(Duration::from_millis(100), move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = runs.load(std::sync::atomic::Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 runs, saw {seen}");

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = runs.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after <= seen + 1, "tick kept firing after cancel");
    }
}
