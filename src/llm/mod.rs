pub mod chat;
pub mod images;
pub mod retry;

pub use chat::{ChatPromptGenerator, PromptGenerator};
pub use images::{
    FailureKind, GenerationError, ImageRequestClient, ImageRequestSettings, OpenAiImagesApi,
    StyleHint,
};
pub use retry::RetryPolicy;
