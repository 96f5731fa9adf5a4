//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn};

// Event core errors.
#[derive(Debug)]
pub enum Error {
    // A (descriptor, event-kind) registration already exists.
    DuplicateRegistration,
    // The descriptor is not currently registered for the given kind.
    NotRegistered,
    // A timer callback panicked while running (debug builds re-raise this
    // instead of constructing it; release builds log and continue).
    CallbackPanicked(String),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::DuplicateRegistration => {
                warn!("{}", self);
            }
            Error::NotRegistered => {
                warn!("{}", self);
            }
            Error::CallbackPanicked(msg) => {
                error!(panic = %msg, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::DuplicateRegistration => {
                write!(f, "a callback is already registered for this (descriptor, event-kind) pair")
            }
            Error::NotRegistered => {
                write!(f, "no callback registered for this (descriptor, event-kind) pair")
            }
            Error::CallbackPanicked(_) => {
                write!(f, "scheduled callback panicked")
            }
        }
    }
}

impl std::error::Error for Error {}
