//! The governance subsystems: gate evaluators, knowledge graph, drift
//! detection, domain boundaries, the audit orchestrator, and the amendment
//! protocol.

pub mod amend;
pub mod audit;
pub mod boundary;
pub mod drift;
pub mod gates;
pub mod knowledge;
pub mod semantic;
