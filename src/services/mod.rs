pub mod catalog;
pub mod engine;
pub mod job_state;
pub mod parser;
pub mod prompt;
pub mod resize;
pub mod runner;
pub mod vision;
