pub mod converter;
pub mod factory;
pub mod models;
pub mod openai;
pub mod reliable;
pub mod sse;

pub mod mock;

pub use factory::DefaultProviderFactory;
pub use mock::{MockProvider, MockProviderFactory, MockResponse};
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
