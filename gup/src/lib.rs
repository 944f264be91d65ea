// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::builder::Builder;
pub use self::gupfile::{BuildScript, Gupfile};
pub use self::jobserver::Jobserver;
pub use self::state::TargetState;

pub mod builder;
pub mod cli;
pub mod env;
pub mod gupfile;
pub mod jobserver;
pub mod lock;
pub mod signal;
pub mod state;
pub mod task;
pub mod util;
