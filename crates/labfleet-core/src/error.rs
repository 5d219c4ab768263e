//! Error types for labfleet core
//!
//! Provides error handling for:
//! - Sandbox provisioning failures (capacity, timeouts, platform rejections)
//! - Access policy denials
//! - Grading timeouts and aborted submissions
//! - Classroom integration delivery failures

use crate::config::ConfigError;
use crate::submission::Submission;
use labfleet_policy::PolicyError;
use labfleet_workspace::{ExerciseId, IdError, StoreError, StudentId};
use std::time::Duration;

/// Main labfleet error type
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// No sandbox could be brought up for the student
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// A grant check refused the operation
    #[error("{0}")]
    Policy(#[from] PolicyError),

    /// The suite deadline passed; the partial submission is attached
    #[error("grading timed out for {}/{}", .submission.student(), .submission.exercise())]
    GradingTimeout {
        /// Submission with completed checks and `NotCompleted` for the rest
        submission: Box<Submission>,
    },

    /// The sandbox failed mid-grading and could not be recovered
    #[error("grading aborted for {}/{}: {reason}", .submission.student(), .submission.exercise())]
    GradingAborted {
        /// Submission as far as it got
        submission: Box<Submission>,
        /// What went wrong
        reason: String,
    },

    /// The classroom side refused or did not answer
    #[error("integration error: {0}")]
    Integration(#[from] IntegrationError),

    /// Sandbox platform failure outside provisioning
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// Workspace store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed student or exercise identifier
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// The submission names an exercise that does not exist
    #[error("unknown exercise: {0}")]
    UnknownExercise(ExerciseId),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The grading queue is full
    #[error("grading queue full")]
    QueueFull,

    /// The fleet is shutting down
    #[error("fleet is shutting down")]
    ShuttingDown,
}

impl FleetError {
    /// Check if error is retryable
    ///
    /// Access denials, bad identifiers and configuration errors never are.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provision(e) => e.is_retryable(),
            Self::Platform(e) => e.is_transient(),
            Self::Integration(_) | Self::QueueFull | Self::GradingAborted { .. } => true,
            _ => false,
        }
    }

    /// True for a policy denial
    #[inline]
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Policy(PolicyError::AccessDenied { .. }))
    }

    /// Partial or aborted submission carried by a grading error
    #[must_use]
    pub fn submission(&self) -> Option<&Submission> {
        match self {
            Self::GradingTimeout { submission } | Self::GradingAborted { submission, .. } => {
                Some(submission)
            }
            _ => None,
        }
    }
}

/// Sandbox provisioning errors
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The platform has no room for another machine right now
    #[error("capacity unavailable: {0}")]
    CapacityUnavailable(String),

    /// The platform refused the request outright
    #[error("platform rejected request ({status}): {message}")]
    Rejected {
        /// Upstream status code
        status: u16,
        /// Upstream message
        message: String,
    },

    /// One attempt did not reach a started machine in time
    #[error("machine did not start within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The machine came up in a terminal state
    #[error("machine {machine_id} entered state {state}")]
    Unhealthy {
        /// Platform machine id
        machine_id: String,
        /// State reported by the platform
        state: String,
    },

    /// Any other platform failure
    #[error(transparent)]
    Platform(PlatformError),

    /// Every attempt failed
    #[error("gave up provisioning for {student} after {attempts} attempts: {last}")]
    Exhausted {
        /// Student the sandbox was for
        student: StudentId,
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<ProvisionError>,
    },
}

impl ProvisionError {
    /// Worth another attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::CapacityUnavailable(_) | Self::Timeout(_) | Self::Unhealthy { .. } => true,
            Self::Platform(e) => e.is_transient(),
            Self::Rejected { .. } | Self::Exhausted { .. } => false,
        }
    }
}

impl From<PlatformError> for ProvisionError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Capacity(message) => Self::CapacityUnavailable(message),
            PlatformError::Rejected { status, message } => Self::Rejected { status, message },
            other => Self::Platform(other),
        }
    }
}

/// Sandbox platform errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    /// No such machine
    #[error("machine not found: {0}")]
    NotFound(String),

    /// Out of capacity (429/503 class responses)
    #[error("capacity unavailable: {0}")]
    Capacity(String),

    /// Permanent refusal (4xx class responses)
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// Upstream status code
        status: u16,
        /// Upstream message
        message: String,
    },

    /// The machine died or was destroyed underneath a running command
    #[error("machine gone: {0}")]
    MachineGone(String),

    /// Network or decoding failure talking to the platform
    #[error("transport error: {0}")]
    Transport(String),
}

impl PlatformError {
    /// Worth retrying after a backoff
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Transport(_))
    }
}

/// Classroom integration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrationError {
    /// The classroom endpoint answered with an error status
    #[error("classroom returned {status}: {message}")]
    Status {
        /// HTTP status
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Could not reach the classroom endpoint
    #[error("classroom unreachable: {0}")]
    Unreachable(String),
}
