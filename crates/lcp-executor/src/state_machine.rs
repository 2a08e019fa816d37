//! Explicit state machine for one executor invocation: an enum of
//! states, an enum of events, and an `apply` that returns a typed
//! transition error instead of silently coercing illegal states.

/// Runtime states a claimed loader run passes through. A superset of
/// `lcp_schemas::LoadStatus` restricted to the states an executor
/// invocation itself may observe or produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Claimed by the scheduler; executor is working.
    Running,
    /// Executor completed successfully.
    Idle,
    /// Executor failed; `failed_since` was set.
    Failed,
}

/// Events an executor invocation may raise against its own run state.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// All steps of the run completed (including the zero-tuple
    /// no-op case).
    Completed,
    /// Any step failed.
    Failed { detail: String },
}

/// Returned when `RunEvent` is applied to a `RunState` that cannot legally
/// receive it — in practice this only fires if the same invocation is
/// driven twice, which is a caller bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RunState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal executor transition from {:?}", self.from)
    }
}

impl std::error::Error for TransitionError {}

/// Apply `event` to a run currently in `from`. Only `Running` accepts
/// either terminal event; `Idle`/`Failed` are terminal for this
/// invocation (a fresh claim starts a fresh `RunState::Running`).
pub fn apply(from: RunState, event: &RunEvent) -> Result<RunState, TransitionError> {
    match (from, event) {
        (RunState::Running, RunEvent::Completed) => Ok(RunState::Idle),
        (RunState::Running, RunEvent::Failed { .. }) => Ok(RunState::Failed),
        (from, _) => Err(TransitionError { from }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_completes_to_idle() {
        assert_eq!(apply(RunState::Running, &RunEvent::Completed), Ok(RunState::Idle));
    }

    #[test]
    fn running_fails_to_failed() {
        let result = apply(
            RunState::Running,
            &RunEvent::Failed {
                detail: "borrow timeout".to_string(),
            },
        );
        assert_eq!(result, Ok(RunState::Failed));
    }

    #[test]
    fn idle_cannot_receive_another_event() {
        let err = apply(RunState::Idle, &RunEvent::Completed).unwrap_err();
        assert_eq!(err.from, RunState::Idle);
    }
}
