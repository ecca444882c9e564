//! Execution layer — the coordinator, bulk orchestrator, and the agent
//! transport seam.

pub mod bulk;
pub mod coordinator;
pub mod transport;

pub use bulk::{BulkOrchestrator, BulkReport, ItemOutcome, RejectedItem};
pub use coordinator::ExecutionCoordinator;
pub use transport::{
    AgentEvent, AgentStream, AgentTransport, HttpAgentTransport, InvokeOutcome, InvokeRequest,
};
