#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client library with pipelined sequences.
//!
//! Besides plain request/response calls on fids, this crate lets a client
//! push a dependent series of operations (walk, open, read, clunk, ...) onto
//! the wire back to back, without waiting for each reply, and still observe
//! every result in order.
//!
//! # Overview
//!
//! - [`conn::Conn`] multiplexes one transport between many tasks, matching
//!   replies to requests by tag.
//! - [`fid::Fid`] performs single requests: every call is one round trip.
//! - [`fsys::Fsys`] is an attached tree with path based helpers.
//! - [`sequencer::Sequencer`] pipelines operations in trees of nested
//!   sequences. The first failure anywhere aborts the whole tree.
//! - [`ns::Ns`] builds path operations as one sequence each, and
//!   [`stream::ReadStream`] keeps many reads in flight.
//!
//! # Example
//!
//! ```no_run
//! use seq9p::{ConnConfig, Ns, Result, dial, om};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = dial("tcp!127.0.0.1!564", ConnConfig::default()).await?;
//!     let fsys = conn.attach(None, "glenda", "").await?;
//!     let ns = Ns::new(fsys.root().clone()).await?;
//!
//!     let mut rs = ns.read_stream("/lib/words", 10, 8192).await?;
//!     rs.copy_to(&mut tokio::io::stdout()).await?;
//!
//!     let f = ns.open("/tmp/scratch", om::WRITE).await?;
//!     f.write(b"hello\n").await?;
//!     f.close().await
//! }
//! ```
//!
//! # Sequencing on the wire
//!
//! A sequence owns one tag. It starts with `Tbegin`, every message in it
//! carries that tag, and it ends with `Tend`. The server runs the messages in
//! order and stops at the first failure, answering nothing more until `Tend`.
//! Fids cloned inside a sequence belong to it until it ends successfully; on
//! failure they are released.
//!
//! # Transport
//!
//! [`dial`] understands `"tcp!host!port"` and `"unix!path"`. Any other
//! `AsyncRead`/`AsyncWrite` pair can be handed to [`Conn::new`].
pub mod composite;
pub mod conn;
pub mod dial;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fsys;
pub mod ns;
mod phase;
pub mod queue;
pub mod req;
mod sequence;
pub mod sequencer;
pub mod serialize;
pub mod stream;
#[macro_use]
pub mod utils;

pub use crate::composite::{PathWalk, SeqOps};
pub use crate::conn::{Conn, ConnConfig};
pub use crate::dial::{dial, mount};
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fid::{Fid, FidState};
pub use crate::fsys::Fsys;
pub use crate::ns::{Ns, NsFile};
pub use crate::req::{BasicReq, CompositeReq, Req, SeqResult};
pub use crate::sequencer::Sequencer;
pub use crate::stream::{ReadStream, read_stream};
pub use crate::utils::Result;
