pub mod camera;
pub mod config;
pub mod error;
pub mod gesture;
pub mod logging;
pub mod pipeline;
pub mod pose;
pub mod protocol;
pub mod service;
pub mod sink;
pub mod tracker;
