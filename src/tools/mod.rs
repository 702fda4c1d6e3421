//! 工具箱：子研究可用的 search / reflect 工具、注册表与带超时的执行器

pub mod executor;
pub mod reflect;
pub mod registry;
pub mod search;

pub use executor::ToolExecutor;
pub use reflect::{reflection_recorded, ReflectArgs, ReflectTool};
pub use registry::{Tool, ToolRegistry};
pub use search::SearchTool;
