//! JS bindings for `kinode_core`.
mod credibility;
mod system;

pub use system::WasmModel;
