use crate::core::state::TrackId;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Who a timer fires for. `track` is `None` for feature-global timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerOwner {
    pub feature: String,
    pub track: Option<TrackId>,
}

#[derive(Debug, Clone)]
struct Timer {
    owner: TimerOwner,
    deadline: Instant,
    period: Option<Duration>,
}

/// Page-wide timer table. A cleared id never fires again.
#[derive(Debug, Default)]
pub struct TimerQueue {
    timers: BTreeMap<TimerId, Timer>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        owner: TimerOwner,
        deadline: Instant,
        period: Option<Duration>,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.insert(
            id,
            Timer {
                owner,
                deadline,
                period: period.filter(|p| !p.is_zero()),
            },
        );
        id
    }

    pub fn clear(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn is_live(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Removes one-shot timers that are due and re-arms periodic ones.
    /// Due timers are returned in deadline order.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, TimerOwner)> {
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (t.deadline, *id))
            .collect();
        due.sort();

        let mut fired = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            let owner = timer.owner.clone();
            match timer.period {
                Some(period) => timer.deadline = now + period,
                None => {
                    self.timers.remove(&id);
                }
            }
            fired.push((id, owner));
        }
        fired
    }

    pub fn clear_all(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> TimerOwner {
        TimerOwner {
            feature: "auto_scroll".to_string(),
            track: Some(1),
        }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let id = queue.schedule(owner(), now + Duration::from_millis(10), None);

        assert!(queue.take_due(now).is_empty());
        let fired = queue.take_due(now + Duration::from_millis(10));
        assert_eq!(fired, vec![(id, owner())]);
        assert!(queue.take_due(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_periodic_rearms() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let period = Duration::from_millis(100);
        queue.schedule(owner(), now + period, Some(period));

        assert_eq!(queue.take_due(now + period).len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + period * 2));
    }

    #[test]
    fn test_cleared_timer_never_fires() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let id = queue.schedule(owner(), now, None);
        assert!(queue.clear(id));
        assert!(!queue.clear(id));
        assert!(queue.take_due(now + Duration::from_secs(5)).is_empty());
    }
}
