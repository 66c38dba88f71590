//! Requests from and responses to the transaction layer.
use bitbybit::{bitenum, bitfield};
use heapless::Vec;
use serde::Serialize;

use crate::frame::{FRAME_LEN, MAX_PAYLOAD};
use crate::shadow::{PecCounts, RegFlags};
use crate::transport::Direction;
use crate::{Status, MAX_DEVICES};

/// Largest register write payload in words.
pub const MAX_WRITE_WORDS: usize = MAX_DEVICES * MAX_PAYLOAD / 2;

/// Parameters of a request.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct RequestFlags {
    /// Number of devices in the chain.
    #[bits(0..=7, rw)]
    pub num_devs: u8,
    /// End to send from.
    #[bits(8..=8, rw)]
    pub dir: Direction,
    /// Retry failed reads from the other end and classify breaks.
    #[bit(9, rw)]
    pub need_loopback: bool,
    /// Check the ACKs of broadcasts and register writes.
    #[bit(10, rw)]
    pub need_response: bool,
    /// Spin on transfer completion within one tick.
    #[bit(11, rw)]
    pub synchronous: bool,
    /// Use tagged reads.
    #[bit(12, rw)]
    pub use_tag: bool,
    /// Check the ACKs of the configuration write back of a poll cycle.
    #[bit(13, rw)]
    pub use_ack: bool,
}

/// Flags reported with a response.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct ResponseFlags {
    /// Devices that answered.
    #[bits(0..=7, rw)]
    pub num_devs: u8,
    #[bits(8..=8, rw)]
    pub dir: Direction,
    #[bit(9, rw)]
    pub got_loopback: bool,
    #[bit(10, rw)]
    pub got_response: bool,
    #[bit(11, rw)]
    pub synchronous: bool,
    /// At least one device returned a wrong tag.
    #[bit(12, rw)]
    pub tag_fail: bool,
}

#[bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq, Default)]
pub enum BerMode {
    /// Sweep the interval between the configured bounds.
    #[default]
    Sweep = 0,
    /// Keep the interval fixed.
    Fixed = 1,
}

#[bitfield(u8, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct DiagFlags {
    #[bit(0, rw)]
    pub running: bool,
    #[bits(1..=1, rw)]
    pub mode: BerMode,
    /// Sweep towards longer intervals.
    #[bit(2, rw)]
    pub rising: bool,
}

/// Counters selected for clearing.
#[bitfield(u8, default = 0)]
#[derive(Debug, PartialEq, Eq)]
pub struct ClearSelect {
    #[bit(0, rw)]
    pub cycle_count: bool,
    #[bit(1, rw)]
    pub host_crc: bool,
    #[bit(2, rw)]
    pub device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diag {
    /// Start, update or stop a bit error rate run.
    Ber {
        flags: DiagFlags,
        time_ms: u16,
        delta_ms: u16,
    },
    /// Read the poll cycle and error counters.
    Read,
    /// Clear the selected counters.
    Clear(ClearSelect),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    /// Send raw bytes.
    Passthrough(Vec<u8, FRAME_LEN>),
    /// Read a register, optionally in its tagged form.
    RegRead { addr: u8 },
    /// Write a register. `data` holds the words per device in chain order from the head.
    RegWrite {
        addr: u8,
        data: Vec<u16, MAX_WRITE_WORDS>,
    },
    /// Run a full poll cycle.
    Convert,
    Diag(Diag),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub flags: RequestFlags,
    /// Tag of tagged reads.
    pub tag: u8,
}

impl Request {
    pub fn new(command: Command, flags: RequestFlags) -> Self {
        Self {
            command,
            flags,
            tag: 0,
        }
    }

    pub fn with_tag(self, tag: u8) -> Self {
        Self {
            tag,
            flags: self.flags.with_use_tag(true),
            ..self
        }
    }
}

/// Register contents of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readback {
    pub flags: RegFlags,
    pub words: Vec<u16, 3>,
}

/// Error counters of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorCounts {
    /// Missing responses seen by the host. Not tracked.
    pub host_response: u16,
    pub host_crc: u16,
    pub device: u16,
}

impl From<PecCounts> for ErrorCounts {
    fn from(pec: PecCounts) -> Self {
        Self {
            host_response: 0,
            host_crc: pec.host,
            device: pec.device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    #[default]
    None,
    Passthrough(Vec<u8, FRAME_LEN>),
    /// Per device, in wire order of the end read from.
    Registers(Vec<Readback, MAX_DEVICES>),
    Diag {
        cycle_count: u32,
        counts: Vec<ErrorCounts, MAX_DEVICES>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub flags: ResponseFlags,
    pub body: Body,
}

/// Outcome of starting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Started {
    /// Accepted. The response is returned by a later tick.
    Deferred,
    /// Completed immediately.
    Complete(Response),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let f = RequestFlags::default()
            .with_num_devs(4)
            .with_dir(Direction::B)
            .with_synchronous(true);
        assert_eq!(f.raw_value(), 0x0904);
        let r = Request::new(Command::RegRead { addr: 0x0d }, f).with_tag(7);
        assert!(r.flags.use_tag());
        assert_eq!(r.tag, 7);

        let d = DiagFlags::default()
            .with_running(true)
            .with_mode(BerMode::Fixed);
        assert_eq!(d.raw_value(), 0b011);
        assert!(ClearSelect::new_with_raw_value(0b110).host_crc());
    }

    #[test]
    fn error_counts() {
        let c = ErrorCounts::from(PecCounts { host: 3, device: 1 });
        assert_eq!((c.host_response, c.host_crc, c.device), (0, 3, 1));
    }
}
