pub mod classify;
pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod models;
pub mod provider;
pub mod provider_options;
pub mod stream;
pub mod tool_params;
pub mod tools;
pub mod usage;
