pub mod images;
pub mod metrics;
pub mod pipeline;
pub mod placeholders;
pub mod presentations;
pub mod prompt;
pub mod providers;
pub mod relay;
pub mod sessions;

pub use images::{ImageGenerator, PollPolicy};
pub use pipeline::ImagePipeline;
pub use presentations::PresentationStore;
pub use prompt::PromptBuilder;
pub use relay::GenerationRelay;
pub use sessions::SessionStore;
