// Copyright 2023 runtime-shady-backroom
// This file is part of bilateral-haptic-core.
// bilateral-haptic-core is licensed under the AGPL-3.0 license (see LICENSE file for details).

//! The sync wire protocol: typed messages and their framing/codec.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, FrameAccumulator, DEFAULT_FRAME_CAP_BYTES};
pub use message::{ExecuteBuzzCommand, Message, RawData, RawValue, StartSessionCommand};
