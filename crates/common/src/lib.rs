//! Shared types for the chat session client workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
