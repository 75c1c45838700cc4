use std::rc::Rc;
use std::time::Duration;

use crate::delegate::DelegateRegistry;

/// Anything driven by the caller's cooperative tick.
pub trait Updateable {
    fn update(&self, dt: Duration);
}

const MAX_FRAME_DELTA: Duration = Duration::from_millis(250);

/// Accumulates frame time and hands it out in fixed steps.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_rate: u32,
    dt: Duration,
    accumulator: Duration,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: Duration::from_secs(1) / tick_rate,
            accumulator: Duration::ZERO,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    /// Large deltas are clamped so one slow frame cannot trigger a burst of ticks.
    pub fn accumulate(&mut self, delta: Duration) {
        self.accumulator += delta.min(MAX_FRAME_DELTA);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator >= self.dt
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            true
        } else {
            false
        }
    }

    pub fn alpha(&self) -> f32 {
        self.accumulator.as_secs_f32() / self.dt.as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}

/// Caller-owned driver for every registered [`Updateable`].
///
/// Updateables may be added or removed from inside their own `update`.
pub struct UpdateScheduler {
    updateables: DelegateRegistry<dyn Updateable>,
    timestep: FixedTimestep,
}

impl UpdateScheduler {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            updateables: DelegateRegistry::new(),
            timestep: FixedTimestep::new(tick_rate),
        }
    }

    pub fn add(&self, updateable: Rc<dyn Updateable>) -> bool {
        self.updateables.add(updateable)
    }

    pub fn remove(&self, updateable: &dyn Updateable) -> bool {
        self.updateables.remove(updateable)
    }

    pub fn len(&self) -> usize {
        self.updateables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updateables.is_empty()
    }

    pub fn tick_interval(&self) -> Duration {
        self.timestep.dt()
    }

    /// Runs one pass with the given delta.
    pub fn tick(&self, dt: Duration) {
        self.updateables.for_each(|u| u.update(dt));
    }

    /// Feeds wall-clock frame time and runs as many fixed-interval passes as it covers.
    pub fn advance(&mut self, frame_delta: Duration) -> u32 {
        self.timestep.accumulate(frame_delta);

        let mut ticks_run = 0;
        while self.timestep.consume_tick() {
            self.tick(self.timestep.dt());
            ticks_run += 1;
        }
        ticks_run
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[derive(Default)]
    struct Counter {
        ticks: Cell<u32>,
        elapsed: Cell<Duration>,
    }

    impl Updateable for Counter {
        fn update(&self, dt: Duration) {
            self.ticks.set(self.ticks.get() + 1);
            self.elapsed.set(self.elapsed.get() + dt);
        }
    }

    #[test]
    fn fixed_timestep_accumulation() {
        let mut ts = FixedTimestep::new(60);

        ts.accumulate(Duration::from_secs(1) / 30);
        assert!(ts.should_tick());
        assert!(ts.consume_tick());
        assert!(ts.consume_tick());
        assert!(!ts.consume_tick());
    }

    #[test]
    fn long_frames_are_clamped() {
        let mut ts = FixedTimestep::new(10);
        ts.accumulate(Duration::from_secs(5));

        let mut ticks = 0;
        while ts.consume_tick() {
            ticks += 1;
        }
        assert_eq!(ticks, 2);
    }

    #[test]
    fn tick_drives_every_updateable() {
        let scheduler = UpdateScheduler::default();
        let a = Rc::new(Counter::default());
        let b = Rc::new(Counter::default());
        scheduler.add(a.clone());
        scheduler.add(b.clone());

        scheduler.tick(Duration::from_millis(16));
        scheduler.tick(Duration::from_millis(16));

        assert_eq!(a.ticks.get(), 2);
        assert_eq!(b.elapsed.get(), Duration::from_millis(32));
    }

    #[test]
    fn advance_runs_fixed_steps() {
        let mut scheduler = UpdateScheduler::new(100);
        let counter = Rc::new(Counter::default());
        scheduler.add(counter.clone());

        assert_eq!(scheduler.advance(Duration::from_millis(35)), 3);
        assert_eq!(counter.elapsed.get(), Duration::from_millis(30));
        assert_eq!(scheduler.advance(Duration::from_millis(5)), 1);
    }

    struct SelfRemoving {
        scheduler: Rc<UpdateScheduler>,
        calls: RefCell<u32>,
    }

    impl Updateable for SelfRemoving {
        fn update(&self, _dt: Duration) {
            *self.calls.borrow_mut() += 1;
            self.scheduler.remove(self);
        }
    }

    #[test]
    fn updateable_can_remove_itself() {
        let scheduler = Rc::new(UpdateScheduler::default());
        let once = Rc::new(SelfRemoving {
            scheduler: scheduler.clone(),
            calls: RefCell::new(0),
        });
        let counter = Rc::new(Counter::default());
        scheduler.add(once.clone());
        scheduler.add(counter.clone());

        scheduler.tick(Duration::from_millis(1));
        scheduler.tick(Duration::from_millis(1));

        assert_eq!(*once.calls.borrow(), 1);
        assert_eq!(counter.ticks.get(), 2);
        assert!(scheduler.len() == 1);
    }
}
