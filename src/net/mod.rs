//! Wire protocol plumbing: framed connections, message classification,
//! streaming file staging, the catalog client, and the HTTP status
//! surface.
pub mod catalog;
pub mod connection;
pub mod http;
pub mod message;
pub mod transfer;
