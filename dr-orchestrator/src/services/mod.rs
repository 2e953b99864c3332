pub mod orchestrator;
pub mod probe;
pub mod restorer;
pub mod workloads;
