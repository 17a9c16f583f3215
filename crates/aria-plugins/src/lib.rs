pub mod builtin;
pub mod enablement;
pub mod error;
pub mod registry;
pub mod schema;
pub mod types;

pub use error::{PluginError, Result};
pub use registry::PluginRegistry;
pub use types::{
    FunctionSchema, ParamKind, ParamSpec, PluginCall, PluginDescriptor, PluginHandler,
    ToolOutcome, ToolSchema,
};
