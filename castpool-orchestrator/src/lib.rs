pub mod alerts;
pub mod events;
pub mod health_monitor;
pub mod maintenance_job;
pub mod pool_manager;
pub mod provider_manager;
pub mod reconciliation;
pub mod redis_store;
pub mod resource_client;
pub mod retry;
pub mod routes;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod transitions;
