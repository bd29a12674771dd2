//! Exercise lifecycle state.
//!
//! `ExerciseState` recorded in `exercise.json` is the source of truth; the
//! bucket directory an exercise sits in is derived from it. Transitions are
//! pure and checked here before any hypervisor or filesystem call.

use facet::Facet;

use crate::error::LabError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum ExerciseState {
    /// Directory claimed, VMs booting or being provisioned.
    Starting,

    /// All VMs booted and provisioned.
    Active,

    /// All VMs managed-saved to disk.
    Suspended,
}

/// Store directory an exercise lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Active,
    Suspended,
}

impl Bucket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Active => "active",
            Bucket::Suspended => "suspended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Activate,
    Suspend,
    Resume,
    Stop,
}

impl Operation {
    pub fn verb(self) -> &'static str {
        match self {
            Operation::Activate => "be activated",
            Operation::Suspend => "be suspended",
            Operation::Resume => "be resumed",
            Operation::Stop => "be stopped",
        }
    }
}

impl ExerciseState {
    pub fn bucket(self) -> Bucket {
        match self {
            ExerciseState::Starting | ExerciseState::Active => Bucket::Active,
            ExerciseState::Suspended => Bucket::Suspended,
        }
    }

    /// State after `op`, or `None` when the exercise ceases to exist.
    ///
    /// `Resume` from `Active` is accepted so a resume interrupted after the
    /// directory move can be retried.
    pub fn transition(self, id: &str, op: Operation) -> Result<Option<ExerciseState>, LabError> {
        use ExerciseState::*;
        match (self, op) {
            (Starting, Operation::Activate) => Ok(Some(Active)),
            (Active, Operation::Suspend) => Ok(Some(Suspended)),
            (Suspended | Active, Operation::Resume) => Ok(Some(Active)),
            (Starting | Active, Operation::Stop) => Ok(None),
            (state, op) => Err(LabError::InvalidState {
                id: id.to_string(),
                operation: op.verb(),
                reason: format!("it is {}", state.describe()),
                hint: hint_for(state, op),
            }),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ExerciseState::Starting => "still starting",
            ExerciseState::Active => "active",
            ExerciseState::Suspended => "suspended",
        }
    }
}

fn hint_for(state: ExerciseState, op: Operation) -> Option<String> {
    match (state, op) {
        (ExerciseState::Suspended, Operation::Stop) => {
            Some("resume the exercise first with `lab resume <id>`".into())
        }
        (ExerciseState::Starting, _) => {
            Some("wait for `lab start` to finish, or stop the exercise".into())
        }
        _ => None,
    }
}

impl std::fmt::Display for ExerciseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}
