pub mod engine;
pub mod reconcile;
pub mod registry;
