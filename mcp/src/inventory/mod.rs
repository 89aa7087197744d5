//! Tool registry and discovery types.
//!
//! - [`ToolDescriptor`]: a tool as reported by its server
//! - [`NamespacedTool`]: a descriptor under its `mcp_<server>_<tool>` name
//! - [`ToolRegistry`]: lock-free snapshot of every published tool proxy

pub mod index;
pub mod types;

pub use index::ToolRegistry;
pub use types::{
    local_tool_name, FunctionDefinition, FunctionSpec, NamespacedTool, ToolDescriptor,
    LOCAL_NAME_PREFIX,
};
