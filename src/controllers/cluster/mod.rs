pub mod api;
pub mod controller;
pub mod owner;
pub mod reconciler;
pub mod reconcilers;

pub use controller::{run, CacheEvent, ControllerConfig};
