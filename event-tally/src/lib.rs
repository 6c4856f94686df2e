pub mod config;
pub mod consumer;
pub mod counter;
pub mod dispatch;
pub mod event;
pub mod routing;
pub mod source;
