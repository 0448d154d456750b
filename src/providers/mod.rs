pub mod anthropic;
pub mod google;
pub mod openai;
pub mod registry;
pub mod router;
pub mod sse;
pub mod traits;
pub mod types;

pub use registry::{find_model, ModelConfig};
pub use router::{ProviderHandle, ProviderRouter, RouteError};
pub use traits::AiProvider;
pub use types::{ChatMessage, ChatRequest, ChatResponse, ImageAttachment, ProviderError, StreamEvent};
