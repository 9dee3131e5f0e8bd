use std::fmt;

/// Whether normalization layers accumulate running statistics (`Training`)
/// or normalize with the accumulated ones (`Evaluation`).
///
/// Passed to every `forward` call; nothing in the crate holds a global mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Training,
    #[default]
    Evaluation,
}

impl ExecutionMode {
    pub fn is_training(self) -> bool {
        matches!(self, ExecutionMode::Training)
    }
}

impl From<bool> for ExecutionMode {
    fn from(train: bool) -> Self {
        if train {
            ExecutionMode::Training
        } else {
            ExecutionMode::Evaluation
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Training => write!(f, "training"),
            ExecutionMode::Evaluation => write!(f, "evaluation"),
        }
    }
}
