//! Conclave Core Library
//!
//! Pure protocol logic for the Conclave session client: the location
//! bitmask, the routing rules, and the server URL grammars. No IO lives
//! here; the networking layer is in `conclave-net`.

pub mod error;
pub mod location;
pub mod router;
pub mod url;

pub use error::{Error, Result};
pub use location::Location;
pub use router::{gather_target, reroute, targets, GatherTarget, Targets};
pub use url::{
    handshake_token, ConnectionSpec, ServerUrl, DEFAULT_DATA_PORT, DEFAULT_RENDER_PORT,
    PROTOCOL_NAME,
};
