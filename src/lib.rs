pub mod clock;
pub mod config;
pub mod crm;
pub mod db;
pub mod handlers;
pub mod lifecycle;
pub mod messages;
pub mod model;
pub mod notify;
pub mod prompts;
pub mod scheduler;
pub mod webhook;
