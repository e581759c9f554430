// src/engine/queue.rs

use std::collections::VecDeque;

use tracing::debug;

use crate::types::SourceUnitId;

use super::scheduler::StartRequest;

/// A run deferred until an instance of its unit exits.
#[derive(Debug)]
pub struct WaitingTask {
    pub request: StartRequest,
}

impl WaitingTask {
    pub fn unit(&self) -> SourceUnitId {
        self.request.compiled.unit
    }
}

/// FIFO of deferred runs.
///
/// Promotion scans from the front and takes the first entry that may start,
/// so an entry blocked by its own unit does not hold back entries for other
/// units.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<WaitingTask>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, task: WaitingTask) {
        debug!(unit = %task.unit(), position = self.entries.len(), "queued waiting run");
        self.entries.push_back(task);
    }

    /// Remove and return the oldest entry for which `eligible` holds.
    pub fn take_first_eligible<F>(&mut self, mut eligible: F) -> Option<WaitingTask>
    where
        F: FnMut(&WaitingTask) -> bool,
    {
        let pos = self.entries.iter().position(|t| eligible(t))?;
        self.entries.remove(pos)
    }

    /// Drop every waiting run of `unit`. Returns how many were dropped.
    pub fn cancel_unit(&mut self, unit: SourceUnitId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|t| t.unit() != unit);
        before - self.entries.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitingTask> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::CompiledUnit;
    use crate::types::RunOptions;
    use std::path::PathBuf;

    fn waiting(unit: u32, arg: &str) -> WaitingTask {
        WaitingTask {
            request: StartRequest {
                compiled: CompiledUnit {
                    unit: SourceUnitId(unit),
                    name: format!("u{unit}"),
                    artifact: PathBuf::from(format!("/c/{unit}.bin")),
                    options: RunOptions::default(),
                },
                args: vec![arg.to_string()],
                interactive: false,
                allow_defer: true,
                ignore_policy: false,
                result_pipe: None,
            },
        }
    }

    #[test]
    fn takes_the_oldest_eligible_entry() {
        let mut q = WaitQueue::new();
        q.push(waiting(1, "a"));
        q.push(waiting(2, "b"));
        q.push(waiting(2, "c"));

        let first = q.take_first_eligible(|t| t.unit() == SourceUnitId(2)).unwrap();
        assert_eq!(first.request.args, vec!["b"]);
        assert_eq!(q.len(), 2);

        assert!(q.take_first_eligible(|t| t.unit() == SourceUnitId(9)).is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn cancel_and_clear() {
        let mut q = WaitQueue::new();
        q.push(waiting(1, "a"));
        q.push(waiting(2, "b"));
        q.push(waiting(1, "c"));

        assert_eq!(q.cancel_unit(SourceUnitId(1)), 2);
        assert_eq!(q.iter().map(|t| t.unit()).collect::<Vec<_>>(), vec![SourceUnitId(2)]);
        assert_eq!(q.clear(), 1);
        assert!(q.is_empty());
    }
}
