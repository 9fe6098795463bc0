//! Coordinating owner of the registry, dispatcher and capture monitor.

pub mod controller_handler;

pub use controller_handler::Controller;
