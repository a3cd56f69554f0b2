#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod communication;
pub mod config;
pub mod dialog;
pub mod identity;
pub mod nat_traversal;
pub mod session;

pub use config::NodeConfig;
pub use dialog::{Dialog, DialogError, DialogEstablisher, DialogWaiter};
pub use nat_traversal::{Pinger, UdpRelayProxy};
pub use session::{Session, SessionConsumer, SessionProvider};
