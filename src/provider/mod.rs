mod openai;
mod traits;

pub use openai::OpenAIProvider;
pub use traits::*;
