//! Shared types for the tabterm session manager.

mod command;
mod event;
mod process;
mod session;
mod tab;
mod ws;

pub use command::*;
pub use event::*;
pub use process::*;
pub use session::*;
pub use tab::*;
pub use ws::*;
