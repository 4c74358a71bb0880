pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod filter;
pub mod library;
pub mod persist;
pub mod scheduler;
pub mod settings;
pub mod upload;
pub mod web;
