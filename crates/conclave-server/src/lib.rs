//! Conclave collaboration daemon.
//!
//! Serves the Conclave binary protocol over TLS. A fresh connection is
//! demultiplexed on its first four bytes into the principal subprotocol,
//! a raw proxy to the local web or peer service, or the screen-share
//! relay. Principal sessions negotiate a role and run either the
//! three-actor session engine (broker, commander, eventer) or the
//! single-task ticket-mode handler (file upload/download, screen-share
//! relay).
//!
//! # Components
//!
//! - [`transport`]: message framing over any async byte stream + TLS setup
//! - [`dispatch`]: accept loop, subprotocol peek, role negotiation
//! - [`session`]: the per-connection three-actor engine
//! - [`ticket_mode`]: ticket-gated bulk transfer and screen relay
//! - [`ticket`]: ticket minting against the ledger
//! - [`backend`]: the named-procedure database seam (Postgres or memory)
//! - [`process`]: uniform subprocess gateway for external helpers

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod proxy;
pub mod session;
pub mod ticket;
pub mod ticket_mode;
pub mod transport;

pub use config::ServerConfig;
pub use dispatch::Server;
pub use error::ServerError;
