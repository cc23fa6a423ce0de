//! A small stream multiplexer over one underlying reliable byte connection,
//! implementing `relay-transport`'s [`Session`]/[`Stream`] seam. This is the
//! production transport a relay server and its hosts/clients speak over a raw
//! TCP (or TLS) socket; `relay-transport::PipePair` plays the same seam
//! in-memory for tests.

#[macro_use]
extern crate tracing;

mod frame;
mod session;

pub use session::{MuxRole, MuxStream, TcpMuxSession};
