use std::time::Instant;

/// Deadlines the dispatcher asks its event loop to wake it for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// Destroy sessions queued on the closed list
    DeleteSessions = 0,
    /// Forget which peers recently received a stateless reset
    ClearResetAddresses = 1,
    /// Expire buffered-packet lists that never completed a handshake
    ExpireBufferedPackets = 2,
    /// Expire time-wait entries
    ExpireTimeWait = 3,
}

const TIMER_COUNT: usize = 4;

const TIMERS: [Timer; TIMER_COUNT] = [
    Timer::DeleteSessions,
    Timer::ClearResetAddresses,
    Timer::ExpireBufferedPackets,
    Timer::ExpireTimeWait,
];

/// One deadline slot per timer
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; TIMER_COUNT],
}

impl TimerTable {
    pub fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// The earliest pending deadline, if any
    pub fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Clear and return every timer whose deadline has passed
    pub fn take_expired(&mut self, now: Instant) -> impl Iterator<Item = Timer> {
        let mut expired = [None; TIMER_COUNT];
        for &timer in &TIMERS {
            if let Some(deadline) = self.data[timer as usize] {
                if deadline <= now {
                    self.data[timer as usize] = None;
                    expired[timer as usize] = Some(timer);
                }
            }
        }
        expired.iter().flatten().copied().collect::<Vec<_>>().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earliest_deadline_wins() {
        let now = Instant::now();
        let mut table = TimerTable::default();
        assert_eq!(table.next_timeout(), None);
        table.set(Timer::DeleteSessions, now + Duration::from_secs(5));
        table.set(Timer::ClearResetAddresses, now + Duration::from_secs(1));
        assert_eq!(table.next_timeout(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn expiry_clears_slots() {
        let now = Instant::now();
        let mut table = TimerTable::default();
        table.set(Timer::DeleteSessions, now);
        table.set(Timer::ExpireTimeWait, now + Duration::from_secs(10));
        let expired: Vec<_> = table.take_expired(now).collect();
        assert_eq!(expired, vec![Timer::DeleteSessions]);
        assert_eq!(table.get(Timer::DeleteSessions), None);
        assert_eq!(
            table.next_timeout(),
            Some(now + Duration::from_secs(10))
        );
    }
}
