//! Client side of the V8 debugger protocol.
//!
//! Layers, leaf first: [`transport`] opens a byte stream (`tcp://`, `ws://`,
//! `wss://`), [`framed`] moves `Content-Length` framed messages over it, and
//! [`protocol`] correlates requests with responses and fans out events.

pub mod framed;
pub mod mock;
pub mod protocol;
pub mod transport;

pub use framed::{ConnectionClosed, ConnectionEvent, FramedConnection};
pub use protocol::{
    BreakEvent, Breakpoint, BreakpointSpec, ClientError, ClientOptions, Command, EventMessage,
    ExceptionEvent, ProtocolClient, Request, RequestError, Response, StepAction,
};
pub use transport::{Transport, TransportError, TransportKind};
