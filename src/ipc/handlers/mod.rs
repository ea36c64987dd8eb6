pub mod allocations;
pub mod attendance;
pub mod config;
pub mod core;
pub mod defaulters;
pub mod directory;
pub mod notifications;
