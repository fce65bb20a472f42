// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cadence trigger scheduler service.

pub mod handlers;
pub mod version;

pub use handlers::{CommandTriggerHandler, COMMAND_TRIGGER_TYPE};
