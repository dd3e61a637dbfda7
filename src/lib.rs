pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gmail;
pub mod hours;
pub mod inbound;
pub mod jobs;
pub mod mime;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod schedule;
pub mod schema;
pub mod state;
pub mod sweeper;
pub mod template;
pub mod tracking;
pub mod workers;

pub use sweeper::Sweeper;
pub use workers::{core_handlers, Dispatcher, JobHandler, JobOutcome};
