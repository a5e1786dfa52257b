pub mod config;
pub mod db;
pub mod jobs;
pub mod lock;
pub mod logging;
pub mod runtime;
