//! Domain models for the slides service.

pub mod generation;
pub mod placeholder;
pub mod session;

pub use generation::{GenerationEvent, GenerationRequest, Language, StepKind};
pub use placeholder::{ImagePlaceholder, ImageResult, PlaceholderKind};
pub use session::{Session, SessionAction};
