// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for trellis-runner.

use std::{
    any::Any,
    sync::{Mutex, MutexGuard},
};

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}

/// Locks a mutex, recovering the data if another thread panicked while holding it.
///
/// Spec bodies panic as a matter of course, so poisoning carries no information here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Utilities for pluralizing various words based on count.
pub(crate) mod plural {
    /// Returns "spec" if `count` is 1, otherwise "specs".
    pub(crate) fn specs_str(count: usize) -> &'static str {
        if count == 1 { "spec" } else { "specs" }
    }

    /// Returns "process" if `count` is 1, otherwise "processes".
    pub(crate) fn processes_str(count: usize) -> &'static str {
        if count == 1 { "process" } else { "processes" }
    }
}
