use tokio::time::{Duration, Instant};

/// Tracks read and write activity on a connection and reports when both
/// have been quiet for the configured timeout.
///
/// After an idle event, the next one is due a full timeout later unless
/// there is activity in between.
#[derive(Debug)]
pub(crate) struct IdleStateMonitor {
    timeout: Duration,
    last_read: Instant,
    last_write: Instant,
    last_idle_event: Option<Instant>,
}

impl IdleStateMonitor {
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            timeout,
            last_read: now,
            last_write: now,
            last_idle_event: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn touch_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn touch_write(&mut self) {
        self.last_write = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        std::cmp::max(self.last_read, self.last_write)
    }

    /// The instant at which the next idle event fires if nothing happens.
    pub fn deadline(&self) -> Instant {
        let base = match self.last_idle_event {
            Some(at) => std::cmp::max(at, self.last_activity()),
            None => self.last_activity(),
        };
        base + self.timeout
    }

    /// Record that an idle event fired.
    pub fn mark_idle_event(&mut self) {
        self.last_idle_event = Some(Instant::now());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_latest_activity() {
        let mut m = IdleStateMonitor::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(start + Duration::from_secs(10), m.deadline());

        tokio::time::advance(Duration::from_secs(4)).await;
        m.touch_read();
        assert_eq!(start + Duration::from_secs(14), m.deadline());

        tokio::time::advance(Duration::from_secs(2)).await;
        m.touch_write();
        assert_eq!(start + Duration::from_secs(16), m.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_events_repeat_after_a_full_timeout() {
        let mut m = IdleStateMonitor::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(10)).await;
        m.mark_idle_event();
        assert_eq!(Instant::now() + Duration::from_secs(10), m.deadline());

        tokio::time::advance(Duration::from_secs(1)).await;
        m.touch_read();
        assert_eq!(Instant::now() + Duration::from_secs(10), m.deadline());
    }
}
