//! Kijang core library: the streaming session controller behind the chat client,
//! with payload parsing, reply accumulation, the message log, connection lifecycle
//! and the HTTP/SSE transport.

pub mod accumulator;
pub mod config;
pub mod controller;
pub mod fragment;
pub mod init;
pub mod lifecycle;
pub mod message;
pub mod prompts;
pub mod session;
pub mod transport;

pub use controller::{Notification, SendOutcome, SessionController, Status, SubscriptionId};
pub use message::{Message, Sender};
