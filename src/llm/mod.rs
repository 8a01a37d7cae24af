#[cfg(feature = "openai")]
pub mod client;
pub mod prompts;
pub mod service;

#[cfg(feature = "openai")]
pub use client::*;
pub use prompts::*;
pub use service::*;
