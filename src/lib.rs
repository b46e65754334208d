//! Caption job engine
//!
//! Batch auto-captioning of image datasets through a local vision-language
//! model server (Ollama or LM Studio), with durable, pausable and
//! cancellable jobs and an HTTP control surface.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
