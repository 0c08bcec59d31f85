// SPDX-License-Identifier: AGPL-3.0-only

//! Attack backend implementations
//!
//! Two backends available:
//! - **Tape**: records the objective on a Wengert tape every step and replays
//!   it in reverse
//! - **Session**: binds the batch variables once and runs a fused closed-form
//!   forward/backward/update per step
//!
//! Both evaluate the same objective and must agree to float tolerance.

pub mod session;
pub mod tape;

pub use session::SessionBackend;
pub use tape::TapeBackend;
