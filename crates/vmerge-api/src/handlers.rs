//! Request handlers.

pub mod health;
pub mod merge;

pub use health::*;
pub use merge::*;
