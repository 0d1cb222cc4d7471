pub mod aggregator;
pub mod coercion;
pub mod connection_pool;
pub mod executor;
pub mod generation;
pub mod introspection;
pub mod llm_service;
pub mod orchestrator;
pub mod planner;
pub mod result_cache; // Fetch result cache keyed on payload and contract hash
pub mod retry;
pub mod schema_registry;
pub mod sources;

pub use aggregator::{aggregate, AggregateOutput};
pub use connection_pool::{ConnectionPoolManager, PoolSettings};
pub use executor::Executor;
pub use generation::{KeywordClassifier, QueryGenerator, SourceClassifier};
pub use llm_service::LlmQueryGenerator;
pub use orchestrator::{QueryAnswer, QueryOrchestrator};
pub use planner::{PlanDiagnostics, Planner};
pub use result_cache::ResultCache;
pub use schema_registry::{SchemaRegistry, ValidationReport};
