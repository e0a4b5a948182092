//! Reverse TCP tunnel.
//!
//! A client behind NAT holds a command connection to the server and registers
//! a remote port. The server accepts public traffic on that port and asks the
//! client, over the command connection, to dial back a data connection for
//! each inbound connection. Bytes are relayed opaquely in both directions.

pub mod backend;
pub mod client;
pub mod duplex;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod stream;
pub mod supervisor;
pub mod target;
