pub mod sse;
pub use sse::{SseEvent, SseLineParser};
