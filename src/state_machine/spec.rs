use std::fmt;

/// Ordered specification of a workflow's states.
///
/// The slice order defines the recommended successor for every state: the
/// entry immediately following it. The terminal state is the last entry and
/// its handler is never invoked by the machine.
#[derive(Debug, Clone, Copy)]
pub struct StateSpec<S: 'static> {
    states: &'static [S],
    initial: S,
    terminal: S,
}

impl<S: Copy + Eq + fmt::Display> StateSpec<S> {
    /// Build a specification from an ordered state list.
    ///
    /// `initial` must appear in `states` and `terminal` must be its last
    /// entry; both are construction-time invariants of a well-formed spec.
    pub fn new(states: &'static [S], initial: S, terminal: S) -> Self {
        debug_assert!(
            states.iter().any(|s| *s == initial),
            "initial state must be listed in the specification"
        );
        debug_assert!(
            states.last().is_some_and(|s| *s == terminal),
            "terminal state must be the last entry of the specification"
        );
        debug_assert!(
            states
                .iter()
                .enumerate()
                .all(|(i, s)| states[..i].iter().all(|seen| seen != s)),
            "states must be unique"
        );
        Self {
            states,
            initial,
            terminal,
        }
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn terminal(&self) -> S {
        self.terminal
    }

    pub fn states(&self) -> &'static [S] {
        self.states
    }

    /// The entry immediately following `state` in specification order, or
    /// `None` past the end of the list (the terminal state has no successor).
    pub fn recommended_after(&self, state: S) -> Option<S> {
        let position = self.states.iter().position(|s| *s == state)?;
        self.states.get(position + 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        First,
        Second,
        Last,
    }

    impl fmt::Display for Phase {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    const PHASES: [Phase; 3] = [Phase::First, Phase::Second, Phase::Last];

    fn spec() -> StateSpec<Phase> {
        StateSpec::new(&PHASES, Phase::First, Phase::Last)
    }

    #[test]
    fn recommended_is_the_following_entry() {
        assert_eq!(spec().recommended_after(Phase::First), Some(Phase::Second));
        assert_eq!(spec().recommended_after(Phase::Second), Some(Phase::Last));
    }

    #[test]
    fn terminal_has_no_recommendation() {
        assert_eq!(spec().recommended_after(Phase::Last), None);
    }

    #[test]
    fn accessors() {
        assert_eq!(spec().initial(), Phase::First);
        assert_eq!(spec().terminal(), Phase::Last);
        assert_eq!(spec().states().len(), 3);
    }
}
