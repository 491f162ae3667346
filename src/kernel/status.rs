//! Boot phase bookkeeping.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Pending,
    Running,
    Done,
    Failed(&'static str),
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseState::Pending => write!(f, "pending"),
            PhaseState::Running => write!(f, "running"),
            PhaseState::Done => write!(f, "done"),
            PhaseState::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Ordered boot phases and how far each got.
#[derive(Debug, Clone)]
pub struct BootPhases<const N: usize> {
    names: [&'static str; N],
    states: [PhaseState; N],
}

impl<const N: usize> BootPhases<N> {
    pub const fn new(names: [&'static str; N]) -> Self {
        Self { names, states: [PhaseState::Pending; N] }
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| *n == name)
    }

    /// Mark `name` running and return its 1-based step number.
    pub fn begin(&mut self, name: &str) -> Option<usize> {
        let i = self.index(name)?;
        self.states[i] = PhaseState::Running;
        Some(i + 1)
    }

    pub fn finish(&mut self, name: &str, outcome: Result<(), &'static str>) {
        if let Some(i) = self.index(name) {
            self.states[i] = match outcome {
                Ok(()) => PhaseState::Done,
                Err(e) => PhaseState::Failed(e),
            };
        }
    }

    pub fn state(&self, name: &str) -> Option<PhaseState> {
        self.index(name).map(|i| self.states[i])
    }

    /// The phase that stopped the boot, with its reason.
    pub fn failure(&self) -> Option<(&'static str, &'static str)> {
        self.iter().find_map(|(name, state)| match state {
            PhaseState::Failed(e) => Some((name, e)),
            _ => None,
        })
    }

    pub fn complete(&self) -> bool {
        self.states.iter().all(|s| *s == PhaseState::Done)
    }

    pub fn total(&self) -> usize {
        N
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, PhaseState)> + '_ {
        self.names.iter().copied().zip(self.states.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_record_their_outcome() {
        let mut phases = BootPhases::new(["a", "b", "c"]);
        assert_eq!(phases.begin("b"), Some(2));
        assert_eq!(phases.state("b"), Some(PhaseState::Running));

        phases.finish("b", Err("no stub"));
        assert_eq!(phases.failure(), Some(("b", "no stub")));
        assert_eq!(phases.state("c"), Some(PhaseState::Pending));
        assert!(!phases.complete());
        assert_eq!(alloc::format!("{}", phases.state("b").unwrap()), "failed: no stub");
    }

    #[test]
    fn boot_is_complete_once_every_phase_is_done() {
        let mut phases = BootPhases::new(["a", "b"]);
        for name in ["a", "b"] {
            phases.begin(name);
            phases.finish(name, Ok(()));
        }
        assert!(phases.complete());
        assert_eq!(phases.failure(), None);
    }

    #[test]
    fn unknown_phase_is_ignored() {
        let mut phases = BootPhases::new(["a"]);
        assert_eq!(phases.begin("z"), None);
        phases.finish("z", Ok(()));
        assert_eq!(phases.state("z"), None);
        assert_eq!(phases.iter().count(), 1);
    }
}
