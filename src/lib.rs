#![cfg_attr(not(test), no_std)]
//! Host driver for a daisy chain of LTC831 battery monitor devices on an isoSPI link.
//!
//! The [Chain] accepts requests from a transaction layer, runs register reads, writes,
//! broadcasts and full poll cycles against the chain from either end, keeps a shadow copy of
//! all device registers and detects breaks in the chain by reading from both ends.

pub mod breaks;
pub mod chain;
pub mod convert;
pub mod error;
pub mod frame;
pub mod request;
pub mod settings;
pub mod shadow;
pub mod transport;

pub use chain::{Chain, InitMode, Pack, Phase, Reading, Readings, State};
pub use error::{Error, Status};
pub use request::{Body, Command, Diag, Request, RequestFlags, Response, Started};
pub use settings::Settings;
pub use transport::{Blocking, Clock, Direction, Instant, IsoSpi};

/// Largest number of devices in a chain.
pub const MAX_DEVICES: usize = 16;

/// Driver version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
