//! Codex Bridge Core Library
//! Session continuity, prompt cache keys and the HTTP bridge driving them

pub mod bridge;
pub mod cache;
pub mod config;
pub mod proxy;
pub mod session;
