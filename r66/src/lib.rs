//! The R66 protocol module of the gateway.
//!
//! A [`service::R66Server`] accepts connections for one local agent and serves
//! the transfers requested on them; an [`client::R66Client`] runs the
//! transfers of one local client against remote partners, sharing one
//! connection per partner through the [`pool::ConnPool`]. Both come in a plain
//! and a TLS variant, see [`module`].
//!
//! Transfers are driven by the [`common::pipeline::Pipeline`]; this crate
//! speaks the protocol and translates its errors.

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod hash;
pub mod info;
pub mod module;
pub mod pool;
pub mod protocol;
pub mod server_transfer;
pub mod service;
pub mod session_handler;
pub mod tls;
pub mod transfer_client;

pub use client::R66Client;
pub use module::{Module, R66Module, R66TlsModule, module_for};
pub use service::R66Server;
