//! Backend adapters and the pieces they share
//!
//! Every provider implements the [`Backend`] trait. HTTP adapters send
//! requests through [`http::exchange`] and retry through
//! [`retry::with_retries`], so failure classification lives in one place and
//! each adapter only adds its own error-body detector.

pub mod anthropic;
pub mod descriptor;
pub mod failure;
pub mod gemini;
pub mod http;
pub mod huggingface;
pub mod local;
pub mod openai;
pub mod openai_compat;
pub mod quality;
pub mod rate_limit;
pub mod retry;
pub mod soft_failure;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use descriptor::{Availability, BackendDescriptor, probe_credential};
pub use failure::{BackendFailure, FailureKind};
pub use gemini::GeminiProvider;
pub use huggingface::HuggingFaceProvider;
pub use local::LocalProvider;
pub use openai::OpenAiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use rate_limit::{RateLimitStatus, RequestBudget};
pub use retry::RetryPolicy;
pub use types::{Backend, ChatMessage, ChatRole};
