pub mod anthropic;
pub mod dispatcher;
pub mod facts;
pub mod gateway;
pub mod openai;
pub mod orchestrator;
pub mod provider;

pub use gateway::{GatewayError, LlmGateway};
pub use orchestrator::{Orchestrator, QueryError, QueryReply};
