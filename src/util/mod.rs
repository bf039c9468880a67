// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! Ambient utility modules: logging setup, the panic hook, and the global
//! tokio runtime that hosts the cooperative tick loop.

pub use crate::util::tokio::GLOBAL_TOKIO_RUNTIME;

pub mod logging;
pub mod panic;

mod tokio;
