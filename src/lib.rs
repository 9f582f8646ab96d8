// src/lib.rs
pub mod config;
pub mod contracts;
pub mod env;
pub mod rabbitmq;

pub use rabbitmq::{MessageBus, MessageBusBuilder, MessageBusError, MessageHandler, Shutdown};
