// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod command;

pub use command::{CommandTriggerHandler, COMMAND_TRIGGER_TYPE};
