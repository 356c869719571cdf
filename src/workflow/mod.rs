pub mod graph;
pub mod patch;

pub use graph::{RoleIndex, WorkflowGraph};
pub use patch::PatchSession;
