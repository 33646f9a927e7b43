use std::sync::{Condvar, Mutex};

/// Cooperative progress and cancellation channel threaded through the
/// engine and down into every phase. Cancellation is polled, never
/// preemptive.
pub trait ProgressMonitor {
    fn is_canceled(&self) -> bool;
    fn begin_task(&mut self, name: &str, total: u64);
    fn worked(&mut self, units: u64);
    fn done(&mut self);
}

/// Discards all reports; never canceled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressMonitor for NullProgress {
    fn is_canceled(&self) -> bool {
        false
    }

    fn begin_task(&mut self, _name: &str, _total: u64) {}

    fn worked(&mut self, _units: u64) {}

    fn done(&mut self) {}
}

/// Allocates a fixed slice of a parent monitor's budget to a sub-task
/// and scales the sub-task's own units into that slice. `done` flushes
/// whatever part of the allocation was not yet reported, so a parent
/// always sees exactly `allocation` units per sub-task.
pub struct SubProgress<'a> {
    parent: &'a mut dyn ProgressMonitor,
    allocation: u64,
    total: u64,
    child_worked: u64,
    parent_reported: u64,
}

impl<'a> SubProgress<'a> {
    pub fn new(parent: &'a mut dyn ProgressMonitor, allocation: u64) -> Self {
        Self {
            parent,
            allocation,
            total: 0,
            child_worked: 0,
            parent_reported: 0,
        }
    }
}

impl ProgressMonitor for SubProgress<'_> {
    fn is_canceled(&self) -> bool {
        self.parent.is_canceled()
    }

    fn begin_task(&mut self, _name: &str, total: u64) {
        self.total = total;
    }

    fn worked(&mut self, units: u64) {
        self.child_worked = self.child_worked.saturating_add(units);
        if self.total == 0 {
            return;
        }
        let due = (self.allocation * self.child_worked.min(self.total)) / self.total;
        if due > self.parent_reported {
            self.parent.worked(due - self.parent_reported);
            self.parent_reported = due;
        }
    }

    fn done(&mut self) {
        if self.allocation > self.parent_reported {
            self.parent.worked(self.allocation - self.parent_reported);
            self.parent_reported = self.allocation;
        }
    }
}

/// Cooperative suspension point. A running pipeline calls
/// `wait_while_paused` between operand-level steps; pausing never
/// interrupts a step in flight.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.paused.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pause(&self) {
        *self.state() = true;
    }

    pub fn resume(&self) {
        *self.state() = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.state()
    }

    /// Blocks until resumed. Returns immediately when not paused.
    pub fn wait_while_paused(&self) {
        let mut paused = self.state();
        while *paused {
            paused = match self.resumed.wait(paused) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}
