// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Custom Test Assertions
//!
//! Domain-specific assertion helpers for uaflow integration tests.
//!
//! ## Design Principles
//!
//! - Provide clear, informative failure messages
//! - Support both synchronous and asynchronous assertions
//! - Assert on API statuses, not error strings

use std::fmt::Debug;
use std::time::Duration;

use uaflow_client::{
    ClientResult, ConnectionState, DataValue, Status, StatusCode, SubscriptionNotification,
    Variant,
};

// =============================================================================
// Result Assertions
// =============================================================================

/// Assertion extensions for [`ClientResult`].
pub trait ClientResultAssertions<T> {
    /// Unwraps a success, panicking with the error's status otherwise.
    fn assert_ok(self) -> T;

    /// Asserts the call failed with `expected`.
    fn assert_status(self, expected: Status);

    /// Asserts the call failed with `expected` and carried `code`.
    fn assert_status_code(self, expected: Status, code: StatusCode);
}

impl<T: Debug> ClientResultAssertions<T> for ClientResult<T> {
    fn assert_ok(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => panic!(
                "Expected OK, but got {} ({}): {}",
                err.status(),
                err.category(),
                err
            ),
        }
    }

    fn assert_status(self, expected: Status) {
        match self {
            Ok(value) => panic!("Expected {}, but the call succeeded with {:?}", expected, value),
            Err(err) => assert_eq!(
                err.status(),
                expected,
                "Expected {}, but got {}: {}",
                expected,
                err.status(),
                err
            ),
        }
    }

    fn assert_status_code(self, expected: Status, code: StatusCode) {
        match self {
            Ok(value) => panic!("Expected {}, but the call succeeded with {:?}", expected, value),
            Err(err) => {
                assert_eq!(err.status(), expected, "Unexpected status for: {}", err);
                assert_eq!(
                    err.status_code(),
                    Some(code),
                    "Expected status code {}, but got {:?}",
                    code,
                    err.status_code()
                );
            }
        }
    }
}

// =============================================================================
// DataValue Assertions
// =============================================================================

/// Assertion extensions for [`DataValue`].
pub trait DataValueAssertions {
    /// Assert that the value status is good.
    fn assert_good(&self);

    /// Assert that the value status equals `expected`.
    fn assert_bad(&self, expected: StatusCode);

    /// Assert that the value equals `expected`.
    fn assert_value(&self, expected: &Variant);

    /// Assert that the numeric value is within a tolerance.
    fn assert_approx(&self, expected: f64, tolerance: f64);
}

impl DataValueAssertions for DataValue {
    fn assert_good(&self) {
        assert!(
            self.status.is_good(),
            "Expected good status, but got {} for {:?}",
            self.status,
            self.value
        );
    }

    fn assert_bad(&self, expected: StatusCode) {
        assert_eq!(
            self.status, expected,
            "Expected status {}, but got {}",
            expected, self.status
        );
    }

    fn assert_value(&self, expected: &Variant) {
        assert_eq!(
            &self.value, expected,
            "Expected value {:?}, but got {:?}",
            expected, self.value
        );
    }

    fn assert_approx(&self, expected: f64, tolerance: f64) {
        let actual = match self.value.as_f64() {
            Some(actual) => actual,
            None => panic!("Value {:?} is not numeric", self.value),
        };
        let diff = (actual - expected).abs();
        assert!(
            diff <= tolerance,
            "Expected value {} ± {}, but got {} (diff: {})",
            expected,
            tolerance,
            actual,
            diff
        );
    }
}

// =============================================================================
// Connection Assertions
// =============================================================================

/// Assertion extensions for [`ConnectionState`].
pub trait ConnectionStateAssertions {
    /// Assert that the connection is activated.
    fn assert_activated(&self);

    /// Assert that the connection is terminal.
    fn assert_terminal(&self);
}

impl ConnectionStateAssertions for ConnectionState {
    fn assert_activated(&self) {
        assert_eq!(
            *self,
            ConnectionState::Activated,
            "Expected Activated, but connection is {}",
            self
        );
    }

    fn assert_terminal(&self) {
        assert!(
            self.is_terminal(),
            "Expected Closed or Error, but connection is {}",
            self
        );
    }
}

// =============================================================================
// Notification Assertions
// =============================================================================

/// Assertion extensions for received notifications.
pub trait NotificationAssertions {
    /// Assert that some notification carried `value` for `item_context`.
    fn assert_contains_change(&self, item_context: u64, value: &Variant);

    /// Assert that sequence numbers strictly increase.
    fn assert_in_sequence(&self);
}

impl NotificationAssertions for [SubscriptionNotification] {
    fn assert_contains_change(&self, item_context: u64, value: &Variant) {
        let found = self.iter().flat_map(|n| n.data_changes.iter()).any(|change| {
            change.item_context == item_context && &change.value.value == value
        });
        assert!(
            found,
            "No change with context {} and value {:?} in {} notifications",
            item_context,
            value,
            self.len()
        );
    }

    fn assert_in_sequence(&self) {
        for pair in self.windows(2) {
            assert!(
                pair[0].sequence_number < pair[1].sequence_number,
                "Sequence numbers out of order: {} then {}",
                pair[0].sequence_number,
                pair[1].sequence_number
            );
        }
    }
}

// =============================================================================
// Async Assertions
// =============================================================================

/// Polls `condition` until it holds or `timeout` expires.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition()
}

/// Like [`wait_for`] but panics with `message` on timeout.
pub async fn wait_for_or_panic<F>(timeout: Duration, interval: Duration, message: &str, condition: F)
where
    F: FnMut() -> bool,
{
    if !wait_for(timeout, interval, condition).await {
        panic!("Condition not met within {:?}: {}", timeout, message);
    }
}

// =============================================================================
// Macro Assertions
// =============================================================================

/// Assert that an async operation completes within a timeout.
#[macro_export]
macro_rules! assert_completes_within {
    ($timeout:expr, $future:expr) => {{
        match tokio::time::timeout($timeout, $future).await {
            Ok(result) => result,
            Err(_) => panic!("Operation did not complete within {:?}", $timeout),
        }
    }};
}
