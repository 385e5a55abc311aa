pub mod config;
pub mod engine;
pub mod fields;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod sweeper;
pub mod tenant;
