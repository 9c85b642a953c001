//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call Mutex
//!
//! Wrapper around `std::sync::Mutex::lock()` that on error consumes the
//! poisoned mutex and returns a simple error code instead of panicking.

use std::sync::{Mutex, MutexGuard};

use crate::{common::Result, error::CallError};

pub struct CallMutex<T: ?Sized> {
    /// Human readable label for the mutex
    label: &'static str,
    /// The actual mutex
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    pub fn new(t: T, label: &'static str) -> CallMutex<T> {
        CallMutex {
            mutex: Mutex::new(t),
            label,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(v) => Ok(v),
            Err(_) => Err(CallError::MutexPoisoned(self.label.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_returns_inner() {
        let m = CallMutex::new(5u32, "test");
        assert_eq!(*m.lock().unwrap(), 5);
    }
}
