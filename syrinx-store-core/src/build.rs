//! Build requests and their results.

use std::collections::BTreeMap;

use num_enum::TryFromPrimitive;

use crate::derived_path::DerivedPath;
use crate::realisation::Realisation;

/// How a build request should treat already-valid outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
#[repr(u64)]
pub enum BuildMode {
    #[default]
    Normal = 0,
    Repair = 1,
    Check = 2,
}

/// The status word of a build result. The numeric values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    TransientFailure = 6,
    TimedOut = 7,
    MiscFailure = 8,
    DependencyFailed = 9,
    LogLimitExceeded = 10,
    NotDeterministic = 11,
    ResolvesToAlreadyValid = 12,
    NoSubstituters = 13,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BuildStatus::Built
                | BuildStatus::Substituted
                | BuildStatus::AlreadyValid
                | BuildStatus::ResolvesToAlreadyValid
        )
    }
}

/// What a build attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Success {
        status: BuildStatus,
        built_outputs: BTreeMap<String, Realisation>,
    },
    Failure {
        status: BuildStatus,
        error_msg: String,
        is_non_deterministic: bool,
    },
}

impl BuildOutcome {
    pub fn status(&self) -> BuildStatus {
        match self {
            BuildOutcome::Success { status, .. } | BuildOutcome::Failure { status, .. } => *status,
        }
    }

    pub fn failure(status: BuildStatus, error_msg: impl Into<String>) -> Self {
        BuildOutcome::Failure {
            status,
            error_msg: error_msg.into(),
            is_non_deterministic: false,
        }
    }
}

/// The outcome of one build, with scheduling bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    pub times_built: u64,
    pub start_time: u64,
    pub stop_time: u64,
    /// CPU time in microseconds, when the builder reported it.
    pub cpu_user: Option<u64>,
    pub cpu_system: Option<u64>,
}

impl BuildResult {
    pub fn new(outcome: BuildOutcome) -> Self {
        BuildResult {
            outcome,
            times_built: 0,
            start_time: 0,
            stop_time: 0,
            cpu_user: None,
            cpu_system: None,
        }
    }
}

/// A build result paired with the derived path it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedBuildResult {
    pub path: DerivedPath,
    pub result: BuildResult,
}

/// Whether the remote side considers us trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedFlag {
    Trusted,
    NotTrusted,
}
