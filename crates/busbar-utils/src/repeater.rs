use std::time::{Duration, Instant};

/// Fires at most once per interval. The first check after construction (or
/// after [`force_fire`](Repeater::force_fire)) fires immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct Repeater {
    interval: Duration,
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn maybe<F>(&mut self, mut f: F)
    where
        F: FnMut(Duration),
    {
        if let Some(el) = self.due() {
            f(el);
            self.last_acted = Some(Instant::now());
        }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.due().is_some() {
            self.last_acted = Some(Instant::now());
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }

    fn due(&self) -> Option<Duration> {
        match self.last_acted {
            None => Some(self.interval),
            Some(t) => {
                let el = t.elapsed();
                (el >= self.interval).then_some(el)
            }
        }
    }
}
