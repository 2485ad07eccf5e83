//! Conversational session and command-dispatch engine for Telegram bots.
//!
//! Updates are long-polled by the [`poller`], routed one at a time by the
//! [`manager`], and handled by resumable [`function`]s whose state survives
//! restarts through the [`store`].

pub mod commands;
pub mod config;
pub mod function;
pub mod functions;
pub mod manager;
pub mod model;
pub mod platform;
pub mod poller;
pub mod scheduler;
pub mod shutdown;
pub mod store;
