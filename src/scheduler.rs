//! # Cooperative Scheduler
//!
//! Fixed table of recurring tasks, each with its own cadence. The gateway
//! asks which tasks are due on every loop iteration and runs them in table
//! order. A task that falls behind (a long tick, a stalled host) runs once
//! and resumes its cadence from the current time; missed runs are not
//! replayed.

use crate::config::ScheduleConfig;
use crate::Millis;

/// Recurring jobs of the main loop, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Nmea0183,
    Nmea2000,
    Saildrive,
    Battery,
    ShorePower,
    Priorities,
    StaleSweep,
    LoopStats,
}

impl Task {
    pub const ALL: [Task; 8] = [
        Task::Nmea0183,
        Task::Nmea2000,
        Task::Saildrive,
        Task::Battery,
        Task::ShorePower,
        Task::Priorities,
        Task::StaleSweep,
        Task::LoopStats,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Task::Nmea0183 => "nmea0183",
            Task::Nmea2000 => "nmea2000",
            Task::Saildrive => "saildrive",
            Task::Battery => "battery",
            Task::ShorePower => "shore_power",
            Task::Priorities => "priorities",
            Task::StaleSweep => "stale_sweep",
            Task::LoopStats => "loop_stats",
        }
    }

    fn interval(self, schedule: &ScheduleConfig) -> Millis {
        let interval = match self {
            Task::Nmea0183 => schedule.nmea0183_ms,
            Task::Nmea2000 => schedule.nmea2000_ms,
            Task::Saildrive => schedule.saildrive_ms,
            Task::Battery => schedule.battery_ms,
            Task::ShorePower => schedule.shore_power_ms,
            Task::Priorities => schedule.priorities_ms,
            Task::StaleSweep => schedule.stale_sweep_ms,
            Task::LoopStats => schedule.loop_stats_ms,
        };
        interval.max(1)
    }
}

/// Set of tasks due on one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due(u8);

impl Due {
    pub fn contains(self, task: Task) -> bool {
        self.0 & (1 << task as u8) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Due tasks in execution order.
    pub fn iter(self) -> impl Iterator<Item = Task> {
        Task::ALL.into_iter().filter(move |task| self.contains(*task))
    }

    fn insert(&mut self, task: Task) {
        self.0 |= 1 << task as u8;
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    interval: Millis,
    next_due: Millis,
}

/// Cadence table for [`Task::ALL`].
#[derive(Debug, Clone)]
pub struct Scheduler {
    slots: [Slot; 8],
}

impl Scheduler {
    /// Every task first comes due one interval after `start`.
    pub fn new(schedule: &ScheduleConfig, start: Millis) -> Self {
        let slots = Task::ALL.map(|task| {
            let interval = task.interval(schedule);
            Slot {
                interval,
                next_due: start + interval,
            }
        });
        Scheduler { slots }
    }

    /// Collect the tasks due at `now` and advance their deadlines.
    pub fn due(&mut self, now: Millis) -> Due {
        let mut due = Due::default();
        for (task, slot) in Task::ALL.iter().zip(self.slots.iter_mut()) {
            if now < slot.next_due {
                continue;
            }
            due.insert(*task);
            slot.next_due += slot.interval;
            if slot.next_due <= now {
                slot.next_due = now + slot.interval;
            }
        }
        due
    }

    pub fn interval(&self, task: Task) -> Millis {
        self.slots[task as usize].interval
    }

    /// Time until the earliest task comes due.
    pub fn idle_for(&self, now: Millis) -> Millis {
        self.slots
            .iter()
            .map(|slot| slot.next_due.saturating_sub(now))
            .min()
            .unwrap_or(0)
    }
}

/// Counts loop iterations and turns them into a frequency once per window.
#[derive(Debug, Clone, Copy)]
pub struct LoopStats {
    window_start: Millis,
    ticks: u32,
    frequency: f64,
}

impl LoopStats {
    pub fn new(start: Millis) -> Self {
        LoopStats {
            window_start: start,
            ticks: 0,
            frequency: 0.0,
        }
    }

    pub fn record_tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
    }

    /// Close the current window and return iterations per second over it.
    pub fn sample(&mut self, now: Millis) -> f64 {
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed > 0 {
            self.frequency = self.ticks as f64 * 1000.0 / elapsed as f64;
        }
        self.window_start = now;
        self.ticks = 0;
        self.frequency
    }

    /// Frequency measured over the last closed window.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }
}
