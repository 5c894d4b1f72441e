//! Request-path core of the gateway: admission, account selection, request
//! transformation dispatch, upstream forwarding, SSE teeing, upstream error
//! classification and metering.

pub mod admission;
pub mod billing;
pub mod classify;
pub mod error;
pub mod events;
pub mod handler;
pub mod pipeline;
pub mod selector;
pub mod singleflight;
pub mod sse;
pub mod state;
pub mod token;
pub mod upstream;
pub mod usage;
pub mod wire;

pub use error::{ErrorKind, GatewayError};
pub use handler::router;
pub use state::{AppState, GatewayDeps};
pub use wire::Surface;
