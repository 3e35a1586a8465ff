// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::io;
use thiserror::Error;

/// Result type alias that all fibrio public API functions can use.
pub type Result<T> = std::result::Result<T, FibrioError>;

/// Composite error type to encompass all error types fibrio produces.
///
/// Errors carried here are recoverable and returned by value: a canceled
/// timer wait surfaces as [`FibrioError::Canceled`] from
/// [`Task::sleep`](crate::Task::sleep), and a failed fiber stack allocation
/// surfaces as [`FibrioError::Io`] from
/// [`TaskBuilder::spawn`](crate::TaskBuilder::spawn). Invariant violations
/// (destroying a task that has not terminated, signaling a task twice) are
/// programmer errors and panic instead.
#[derive(Error, Debug)]
pub enum FibrioError {
    /// The awaited operation was canceled before it completed. This is the
    /// code a sleeping task observes when another thread calls
    /// [`Task::wake`](crate::Task::wake) on it.
    #[error("operation canceled")]
    Canceled,

    /// IO error from standard library functions, e.g. while reserving the
    /// memory for a task stack.
    #[error("IO error occurred: {0}")]
    Io(#[from] io::Error),
}

impl FibrioError {
    /// Returns `true` iff this error represents a cancellation rather than
    /// an underlying OS failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, FibrioError::Canceled)
    }
}
