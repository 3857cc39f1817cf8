//! Bootstrap module for assembling a MeshCall participant
//!
//! This module handles:
//! - Configuration loading
//! - Collaborator construction and injection into the room controller

pub mod config;
pub mod services;

pub use config::load_config;
pub use services::{init_controller, TransportKind};
