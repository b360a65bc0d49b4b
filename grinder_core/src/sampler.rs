//! Background load-cell sampling.
//!
//! Spawns a thread that owns the `Scale`, pushes the latest raw reading
//! through a bounded channel and tracks the last-ok timestamp so the
//! consumer can detect a stalled sensor. Event-driven (block on data-ready)
//! and paced variants are provided.
//!
//! Each `Sampler` owns exactly one thread, shut down and joined on drop.
use crossbeam_channel as xch;
use grinder_traits::Scale;
use grinder_traits::clock::Clock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct Sampler {
    rx: xch::Receiver<i32>,
    last_ok: Arc<AtomicU64>,
    read_errors: Arc<AtomicU64>,
    epoch: Instant,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Sampler {
    /// Rate-paced sampler: one read every `1/hz` seconds.
    pub fn spawn<S: Scale + Send + 'static, C: Clock + Send + Sync + 'static>(
        scale: S,
        hz: u32,
        timeout: Duration,
        clock: C,
    ) -> Self {
        let period = Duration::from_micros(crate::util::period_us(hz));
        Self::start(scale, Some(period), timeout, clock)
    }

    /// Event-driven sampler: `scale.read(timeout)` blocks until data-ready,
    /// so no extra sleep is added.
    pub fn spawn_event<S: Scale + Send + 'static, C: Clock + Send + Sync + 'static>(
        scale: S,
        timeout: Duration,
        clock: C,
    ) -> Self {
        Self::start(scale, None, timeout, clock)
    }

    fn start<S: Scale + Send + 'static, C: Clock + Send + Sync + 'static>(
        mut scale: S,
        period: Option<Duration>,
        timeout: Duration,
        clock: C,
    ) -> Self {
        let (tx, rx) = xch::bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_bg = shutdown.clone();
        let last_ok = Arc::new(AtomicU64::new(0));
        let last_ok_bg = last_ok.clone();
        let read_errors = Arc::new(AtomicU64::new(0));
        let read_errors_bg = read_errors.clone();
        let epoch = clock.now();

        let join_handle = std::thread::spawn(move || {
            while !shutdown_bg.load(Ordering::Relaxed) {
                match scale.read(timeout) {
                    Ok(v) => {
                        // Replace an unread sample rather than block.
                        match tx.try_send(v) {
                            Ok(()) | Err(xch::TrySendError::Full(_)) => {}
                            Err(xch::TrySendError::Disconnected(_)) => {
                                tracing::debug!("sampler consumer disconnected, exiting thread");
                                break;
                            }
                        }
                        last_ok_bg.store(clock.ms_since(epoch), Ordering::Relaxed);
                    }
                    Err(e) => {
                        read_errors_bg.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(error = %e, "sampler read failed");
                    }
                }

                if shutdown_bg.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(p) = period {
                    clock.sleep(p);
                }
            }
            tracing::trace!("sampler thread exiting cleanly");
        });

        Self {
            rx,
            last_ok,
            read_errors,
            epoch,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    pub fn latest(&self) -> Option<i32> {
        self.rx.try_iter().last()
    }

    /// Block up to `timeout` for the first sample.
    pub fn wait_first(&self, timeout: Duration) -> Option<i32> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    pub fn stalled_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }

    /// Stall measured against this sampler's epoch on the real clock.
    pub fn stalled_for_now(&self) -> u64 {
        let ms = Instant::now().saturating_duration_since(self.epoch).as_millis();
        self.stalled_for(u64::try_from(ms).unwrap_or(u64::MAX))
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // The thread exits after its current read returns (at most one sensor timeout).
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("sampler thread joined"),
                Err(e) => tracing::warn!(?e, "sampler thread panicked during shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grinder_traits::{BoxError, MonotonicClock};

    struct Counting(i32);
    impl Scale for Counting {
        fn read(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
            self.0 += 1;
            std::thread::sleep(Duration::from_millis(1));
            Ok(self.0)
        }
    }

    struct Broken;
    impl Scale for Broken {
        fn read(&mut self, _timeout: Duration) -> Result<i32, BoxError> {
            std::thread::sleep(Duration::from_millis(1));
            Err("no data".into())
        }
    }

    #[test]
    fn delivers_samples_and_joins_on_drop() {
        let s = Sampler::spawn_event(Counting(0), Duration::from_millis(5), MonotonicClock::new());
        let first = s.wait_first(Duration::from_secs(1)).expect("sample");
        assert!(first >= 1);
        drop(s);
    }

    #[test]
    fn counts_read_errors() {
        let s = Sampler::spawn(Broken, 500, Duration::from_millis(5), MonotonicClock::new());
        std::thread::sleep(Duration::from_millis(30));
        assert!(s.read_errors() > 0);
        assert!(s.latest().is_none());
    }
}
