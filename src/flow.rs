//! Flow State Machine (component F): a pure mode-aware transition function,
//! plus a stateful wrapper with observer registration.
//!
//! Grounded loosely on the donor's `workflow::state::{WorkflowStatus,
//! StageStatus}` transition shape, replaced with the richer tagged-phase
//! domain of §3.2 / §4.F.

use crate::state::{Mode, Phase};

/// Events accepted by the transition function (§4.F).
#[derive(Debug, Clone)]
pub enum Event {
    Start {
        feature: String,
        description: String,
    },
    PhaseComplete,
    Approve,
    Reject,
    TaskComplete(u32),
    Pause,
    Resume,
    PrCreated(String),
    Merge,
    SkipMerge,
    Abort(String),
    Error(String),
}

/// Pure transition function. Any `(phase, event)` pair not covered by the
/// table is a no-op that returns `phase` unchanged.
pub fn transition(phase: Phase, event: Event, mode: Mode) -> Phase {
    if let Event::Abort(reason) = &event {
        if !phase.is_terminal() {
            return Phase::Aborted {
                feature: phase.feature().to_string(),
                reason: reason.clone(),
            };
        }
        return phase;
    }
    if let Event::Error(message) = &event {
        if !phase.is_terminal() {
            return Phase::Error {
                feature: phase.feature().to_string(),
                error_message: message.clone(),
            };
        }
        return phase;
    }

    match (phase, event) {
        (Phase::Idle, Event::Start { feature, description }) => Phase::Initializing { feature, description },

        (Phase::Initializing { feature, .. }, Event::PhaseComplete) => {
            Phase::RequirementsGenerating { feature }
        }

        (Phase::RequirementsGenerating { feature }, Event::PhaseComplete) => {
            Phase::RequirementsApproval { feature }
        }

        (Phase::RequirementsApproval { feature }, Event::Approve) => {
            if mode == Mode::Brownfield {
                Phase::GapAnalysis { feature }
            } else {
                Phase::DesignGenerating { feature }
            }
        }
        (Phase::RequirementsApproval { feature }, Event::Reject) => {
            Phase::RequirementsGenerating { feature }
        }

        (Phase::GapAnalysis { feature }, Event::PhaseComplete) => Phase::GapReview { feature },
        (Phase::GapReview { feature }, Event::Approve) => Phase::DesignGenerating { feature },
        (Phase::GapReview { feature }, Event::Reject) => {
            Phase::RequirementsGenerating { feature }
        }

        (Phase::DesignGenerating { feature }, Event::PhaseComplete) => {
            Phase::DesignApproval { feature }
        }
        (Phase::DesignApproval { feature }, Event::Approve) => {
            if mode == Mode::Brownfield {
                Phase::DesignValidation { feature }
            } else {
                Phase::TasksGenerating { feature }
            }
        }
        (Phase::DesignApproval { feature }, Event::Reject) => {
            Phase::DesignGenerating { feature }
        }

        (Phase::DesignValidation { feature }, Event::PhaseComplete) => {
            Phase::DesignValidationReview { feature }
        }
        (Phase::DesignValidationReview { feature }, Event::Approve) => {
            Phase::TasksGenerating { feature }
        }
        (Phase::DesignValidationReview { feature }, Event::Reject) => {
            Phase::DesignGenerating { feature }
        }

        (Phase::TasksGenerating { feature }, Event::PhaseComplete) => {
            Phase::TasksApproval { feature }
        }
        (Phase::TasksApproval { feature }, Event::Approve) => Phase::Implementing {
            feature,
            current_task: 1,
            total_tasks: 0,
        },
        (Phase::TasksApproval { feature }, Event::Reject) => {
            Phase::TasksGenerating { feature }
        }

        (
            Phase::Implementing {
                feature,
                total_tasks,
                ..
            },
            Event::TaskComplete(i),
        ) => Phase::Implementing {
            feature,
            current_task: i,
            total_tasks,
        },
        (
            Phase::Implementing {
                feature,
                current_task,
                total_tasks,
            },
            Event::Pause,
        ) => Phase::Paused {
            feature,
            paused_at: current_task,
            total_tasks,
        },
        (Phase::Implementing { feature, .. }, Event::PhaseComplete) => {
            Phase::Validation { feature }
        }

        (
            Phase::Paused {
                feature,
                paused_at,
                total_tasks,
            },
            Event::Resume,
        ) => Phase::Implementing {
            feature,
            current_task: paused_at,
            total_tasks,
        },

        (Phase::Validation { feature }, Event::PhaseComplete) => Phase::Pr { feature },

        (Phase::Pr { feature }, Event::PrCreated(url)) => Phase::MergeDecision {
            feature,
            pr_url: url,
        },

        (Phase::MergeDecision { feature, .. }, Event::Merge)
        | (Phase::MergeDecision { feature, .. }, Event::SkipMerge) => {
            Phase::Complete { feature }
        }

        (unchanged, _) => unchanged,
    }
}

/// Listener invoked on every mutation of a `FlowMachine`.
pub type Listener = Box<dyn Fn(&Phase, &Phase) + Send + Sync>;

/// Stateful wrapper: owns the current phase and mode, records every
/// mutation, and fixes `mode` on the first `Start`.
pub struct FlowMachine {
    phase: Phase,
    mode: Option<Mode>,
    listeners: Vec<Listener>,
}

impl FlowMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            mode: None,
            listeners: Vec::new(),
        }
    }

    pub fn resume(phase: Phase, mode: Mode) -> Self {
        Self {
            phase,
            mode: Some(mode),
            listeners: Vec::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn subscribe(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    pub fn dispatch(&mut self, event: Event) -> Phase {
        if let Event::Start { .. } = &event {
            if self.mode.is_none() {
                // Mode for a fresh Start is supplied by the caller via
                // `dispatch_with_mode`; plain `dispatch` keeps whatever mode
                // is already locked, defaulting to greenfield only when none
                // has ever been set.
                self.mode = Some(Mode::Greenfield);
            }
        }
        let mode = self.mode.unwrap_or(Mode::Greenfield);
        let previous = self.phase.clone();
        self.phase = transition(self.phase.clone(), event, mode);
        for listener in &self.listeners {
            listener(&previous, &self.phase);
        }
        self.phase.clone()
    }

    pub fn dispatch_with_mode(&mut self, event: Event, mode: Mode) -> Phase {
        if self.mode.is_none() {
            self.mode = Some(mode);
        }
        let locked_mode = self.mode.unwrap_or(mode);
        let previous = self.phase.clone();
        self.phase = transition(self.phase.clone(), event, locked_mode);
        for listener in &self.listeners {
            listener(&previous, &self.phase);
        }
        self.phase.clone()
    }
}

impl Default for FlowMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_phases(feature: &str) -> Vec<Phase> {
        vec![
            Phase::Idle,
            Phase::Initializing {
                feature: feature.into(),
                description: "d".into(),
            },
            Phase::RequirementsGenerating { feature: feature.into() },
            Phase::RequirementsApproval { feature: feature.into() },
            Phase::GapAnalysis { feature: feature.into() },
            Phase::GapReview { feature: feature.into() },
            Phase::DesignGenerating { feature: feature.into() },
            Phase::DesignApproval { feature: feature.into() },
            Phase::DesignValidation { feature: feature.into() },
            Phase::DesignValidationReview { feature: feature.into() },
            Phase::TasksGenerating { feature: feature.into() },
            Phase::TasksApproval { feature: feature.into() },
            Phase::Implementing {
                feature: feature.into(),
                current_task: 1,
                total_tasks: 4,
            },
            Phase::Paused {
                feature: feature.into(),
                paused_at: 2,
                total_tasks: 4,
            },
            Phase::Validation { feature: feature.into() },
            Phase::Pr { feature: feature.into() },
            Phase::MergeDecision {
                feature: feature.into(),
                pr_url: "https://x/pull/1".into(),
            },
            Phase::Complete { feature: feature.into() },
            Phase::Aborted {
                feature: feature.into(),
                reason: "r".into(),
            },
            Phase::Error {
                feature: feature.into(),
                error_message: "e".into(),
            },
        ]
    }

    #[test]
    fn abort_moves_every_non_terminal_phase_to_aborted() {
        for phase in all_phases("f") {
            let is_terminal = phase.is_terminal();
            let result = transition(phase.clone(), Event::Abort("x".into()), Mode::Greenfield);
            if is_terminal {
                assert_eq!(result.type_tag(), phase.type_tag());
            } else {
                assert_eq!(result.type_tag(), "aborted");
            }
        }
    }

    #[test]
    fn error_moves_every_non_terminal_phase_to_error() {
        for phase in all_phases("f") {
            let is_terminal = phase.is_terminal();
            let result = transition(phase.clone(), Event::Error("x".into()), Mode::Greenfield);
            if is_terminal {
                assert_eq!(result.type_tag(), phase.type_tag());
            } else {
                assert_eq!(result.type_tag(), "error");
            }
        }
    }

    #[test]
    fn transition_is_pure_and_idempotent_under_repetition() {
        let phase = Phase::RequirementsApproval { feature: "f".into() };
        let once = transition(phase.clone(), Event::Approve, Mode::Greenfield);
        let twice = transition(once.clone(), Event::Approve, Mode::Greenfield);
        // Re-applying the same event to the resulting phase is itself a
        // no-op (design-generating has no Approve rule), so the second call
        // is idempotent relative to the first's output.
        assert_eq!(once, twice);
    }

    #[test]
    fn greenfield_skips_gap_analysis() {
        let next = transition(
            Phase::RequirementsApproval { feature: "f".into() },
            Event::Approve,
            Mode::Greenfield,
        );
        assert_eq!(next.type_tag(), "design-generating");
    }

    #[test]
    fn brownfield_enters_gap_analysis() {
        let next = transition(
            Phase::RequirementsApproval { feature: "f".into() },
            Event::Approve,
            Mode::Brownfield,
        );
        assert_eq!(next.type_tag(), "gap-analysis");
    }

    #[test]
    fn brownfield_enters_design_validation_after_design_approval() {
        let next = transition(
            Phase::DesignApproval { feature: "f".into() },
            Event::Approve,
            Mode::Brownfield,
        );
        assert_eq!(next.type_tag(), "design-validation");
    }

    #[test]
    fn unlisted_phase_event_pair_is_a_noop() {
        let phase = Phase::Idle;
        let next = transition(phase.clone(), Event::Approve, Mode::Greenfield);
        assert_eq!(next, phase);
    }

    #[test]
    fn machine_locks_mode_on_first_start() {
        let mut machine = FlowMachine::new();
        machine.dispatch_with_mode(
            Event::Start {
                feature: "f".into(),
                description: "d".into(),
            },
            Mode::Brownfield,
        );
        assert_eq!(machine.mode(), Some(Mode::Brownfield));
        // a later dispatch with a different mode does not change it
        machine.dispatch_with_mode(Event::PhaseComplete, Mode::Greenfield);
        assert_eq!(machine.mode(), Some(Mode::Brownfield));
    }
}
