// Request handlers
pub mod responses;
pub mod sessions;
