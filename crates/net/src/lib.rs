//! Conclave Network Library
//!
//! Client-side session protocol for one or two remote process groups: a
//! data-server cluster and an optional render-server cluster.
//!
//! # Architecture
//!
//! - **Session**: connects via a server URL, routes messages by location
//!   mask, gathers information from a group's root
//! - **Transport**: capability traits over connection establishment and
//!   per-group messaging; TCP implementation included
//! - **Protocol**: tagged length-prefixed frames with big-endian bodies
//!
//! # Usage
//!
//! ```ignore
//! let mut session = Session::new(TcpTransport::new());
//! if session.connect("cdsrs://data-host/render-host").await? {
//!     session.push_state(&msg).await?;
//!     session.gather_information(Location::DATA_SERVER_ROOT, &mut info, id).await?;
//! }
//! session.close().await;
//! ```

pub mod error;
mod frame;
pub mod info;
pub mod protocol;
pub mod session;
pub mod tcp;
pub mod transport;

pub use error::{Error, Result};
pub use info::{Information, JsonInformation};
pub use protocol::{Opcode, RoutedMessage};
pub use session::{ConnectAbort, LocalDelegate, Session};
pub use tcp::{TcpPeerGroup, TcpTransport};
pub use transport::{PeerGroup, PollStatus, TransportProvider};

pub use conclave_core::{Location, ServerUrl};
