//! Margo: a user-space RPC runtime binding a network transport (see
//! [`margo_transport`]) to a cooperatively scheduled ULT runtime (see
//! [`abt`]).
//!
//! [`Instance`] is the root: it owns the Argobots substrate, the
//! transport substrate, the handle cache, the timer wheel, the RPC
//! registry, the progress ULT, and an optional monitor, in that
//! dependency order.

pub mod abt;
pub mod bulk;
mod diagnostics;
mod envelope;
mod error;
mod finalize;
mod handle_cache;
mod identifier;
mod instance;
mod monitor;
mod progress;
mod registry;
mod request;
mod timer;

pub use diagnostics::Diagnostics;
pub use envelope::{Envelope, WireErrorCode};
pub use error::{ErrorKind, MargoError};
pub use identifier::{demux, mux, NO_PROVIDER};
pub use instance::{Instance, NO_PARENT_RPC_ID};
pub use monitor::{Monitor, MonitorEvent, NullMonitor, TracingMonitor};
pub use registry::{HandlerContext, RpcHandler};
pub use request::wait_any;

pub use margo_transport as transport;
