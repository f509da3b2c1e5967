pub mod ensemble;
pub mod json;
pub mod providers;
pub mod retry;

pub use ensemble::{Ensemble, EnsembleRequest, EnsembleResponse, ResponseShape, Validator};
pub use providers::{create_provider, AnthropicProvider, OpenAiProvider, ProviderRegistry};
