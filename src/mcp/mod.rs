//! MCP tool registry and the alarm subsystem built on top of it.

pub mod alarm;
pub mod tools;

pub use alarm::{Alarm, AlarmScheduler, AlarmStore};
pub use tools::{ToolRegistry, ToolResult};
