//! HTTP plumbing for the LLM service: pooled client, retry, error taxonomy
//! and stream framing.

mod client;
mod error;
mod retry;
mod stream;

pub use client::ClientHandle;
pub use error::LlmError;
pub use retry::{Failure, FailureKind, RetryPolicy, classify_error, classify_status};
pub use stream::{
    BodyLineCodec, DATA_PREFIX, DONE_SENTINEL, EventStream, Line, MAX_LINE_LENGTH, StreamEvent,
    error_stream, frames, parse_line,
};
