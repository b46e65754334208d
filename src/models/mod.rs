pub mod api;
pub mod job;
pub mod prompt;
pub mod result;
pub mod settings;
