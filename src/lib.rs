pub mod business_hours;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod wal;
