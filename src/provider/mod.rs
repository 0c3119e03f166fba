pub mod mock;
pub mod openai_compat;
pub mod traits;

pub use mock::{MockProvider, MockResponse, MockToolCall};
pub use openai_compat::OpenAiCompatProvider;
pub use traits::*;
