pub mod breakpoint;
pub mod client;
pub mod events;
pub mod messages;
mod pending;

pub use breakpoint::{Breakpoint, BreakpointSpec, breakpoint_number};
pub use client::{
    ClientError, ClientOptions, DEFAULT_EVENT_CAPACITY, DEFAULT_REQUEST_TIMEOUT, ProtocolClient,
    RequestError,
};
pub use events::{BreakEvent, ExceptionEvent, ScriptRef};
pub use messages::{
    BacktraceArgs, ChangeBreakpointArgs, ClearBreakpointArgs, Command, ContinueArgs,
    EvaluateArgs, EventMessage, FrameArgs, LookupArgs, Request, Response, ScopeArgs, ScopesArgs,
    ScriptFilter, ScriptTypes, ScriptsArgs, SetBreakpointArgs, SourceArgs, StepAction,
};
