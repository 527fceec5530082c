// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status and kind enums stored in the state store.
//!
//! Every enum is persisted as TEXT and serialized with the same spelling, so
//! the values seen by the HTTP layer match what is in the database.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $rename:tt {
            $( $(#[$vmeta:meta])* $variant:ident => $text:tt ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
        #[serde(rename_all = $rename)]
        #[sqlx(rename_all = $rename)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Stored text representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle status of a run.
    ///
    /// Runs move `RUNNING -> {PASSED, FAILED, CANCELLED}` and never leave a
    /// terminal status.
    RunStatus, "SCREAMING_SNAKE_CASE" {
        /// Created but never dispatched.
        NotRun => "NOT_RUN",
        /// Dispatched to a worker.
        Running => "RUNNING",
        /// Finished successfully.
        Passed => "PASSED",
        /// Finished with an error, crash or timeout.
        Failed => "FAILED",
        /// Cancelled by a caller or by a schedule timeout.
        Cancelled => "CANCELLED",
    }
}

impl RunStatus {
    /// Returns true for PASSED, FAILED and CANCELLED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }
}

text_enum! {
    /// Where a run came from.
    OriginKind, "snake_case" {
        /// Direct API call.
        Api => "api",
        /// A schedule execution.
        Schedule => "schedule",
        /// A trigger invocation.
        Trigger => "trigger",
    }
}

text_enum! {
    /// How a schedule computes its fire times.
    ScheduleType, "snake_case" {
        /// Cron expression evaluated in the schedule's timezone.
        Cron => "cron",
        /// Fixed number of seconds between fires.
        Interval => "interval",
        /// Set of weekdays and times of day.
        Weekday => "weekday",
        /// A single fire at a fixed timestamp.
        Once => "once",
    }
}

text_enum! {
    /// Status of one schedule execution attempt.
    ExecutionStatus, "SCREAMING_SNAKE_CASE" {
        /// Row created, run not yet started.
        Triggered => "TRIGGERED",
        /// Run started and not finished.
        Running => "RUNNING",
        /// Run passed.
        Completed => "COMPLETED",
        /// Run failed, timed out or was cancelled, with no retry pending.
        Failed => "FAILED",
        /// Not fired because a dependency, concurrency or rate limit blocked it.
        Skipped => "SKIPPED",
        /// Run failed and a further attempt is due at `retry_at`.
        Retrying => "RETRYING",
    }
}

impl ExecutionStatus {
    /// Returns true while the attempt still owns a run that may be running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Triggered | Self::Running)
    }
}

text_enum! {
    /// Which predecessor outcomes satisfy a schedule dependency.
    DependencyMode, "snake_case" {
        /// Predecessor's latest execution must be COMPLETED.
        AfterSuccess => "after_success",
        /// Predecessor's latest execution must be COMPLETED or FAILED.
        AfterAny => "after_any",
    }
}

text_enum! {
    /// Kind of external event source.
    TriggerType, "snake_case" {
        /// HTTP callback.
        Webhook => "webhook",
        /// Inbound email.
        Email => "email",
        /// Filesystem change.
        FileWatch => "file_watch",
    }
}

text_enum! {
    /// Outcome of a trigger invocation, decided before any run exists.
    InvocationStatus, "SCREAMING_SNAKE_CASE" {
        /// A run was started.
        Accepted => "ACCEPTED",
        /// Disabled trigger, wrong method or bad secret.
        Rejected => "REJECTED",
        /// Per-minute limit reached.
        RateLimited => "RATE_LIMITED",
        /// Payload merge or run start failed.
        Error => "ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::NotRun.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Passed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_serde_matches_stored_text() {
        let json = serde_json::to_string(&InvocationStatus::RateLimited).unwrap();
        assert_eq!(json, "\"RATE_LIMITED\"");
        assert_eq!(InvocationStatus::RateLimited.as_str(), "RATE_LIMITED");

        let json = serde_json::to_string(&TriggerType::FileWatch).unwrap();
        assert_eq!(json, "\"file_watch\"");

        let mode: DependencyMode = serde_json::from_str("\"after_any\"").unwrap();
        assert_eq!(mode, DependencyMode::AfterAny);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("weekday".parse::<ScheduleType>(), Ok(ScheduleType::Weekday));
        assert_eq!("NOT_RUN".parse::<RunStatus>(), Ok(RunStatus::NotRun));
        assert!("hourly".parse::<ScheduleType>().is_err());
    }
}
