//! Session & prompt-cache continuity

pub mod input;
pub mod key;
pub mod registry;
pub mod request;
pub mod state;

pub use input::InputItem;
pub use key::{conversation_key, ensure_prompt_cache_key, CacheKeyResult, CacheKeySource};
pub use registry::{SessionMetrics, SessionRegistry, SessionSummary};
pub use request::ResponsesRequest;
pub use state::{SessionContext, SessionState};
