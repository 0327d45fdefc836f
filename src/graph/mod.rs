pub mod execution_graph;

pub use execution_graph::{GraphNode, WorkflowExecutionGraph};
