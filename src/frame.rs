//! Frame construction and response parsing.
//!
//! A frame is the command header followed by one block per device and, for acknowledged
//! broadcasts, the ACK bitmap. The header is `[addr, pec]` or `[addr | 0x40, tag, pec]` for a
//! tagged read. A block is the payload followed by a big-endian word holding the 2 bit
//! command counter and the 14 bit payload PEC.
//!
//! Block order on the wire depends on the end the frame is sent from. Read responses and ACKs
//! arrive nearest device first. Write payloads are shifted through the chain, so the block for
//! the farthest device leads.
use arbitrary_int::u2;

use crate::breaks::BreakData;
use crate::shadow::Shadow;
use crate::transport::Direction;
use crate::{Error, MAX_DEVICES};
use ltc831::map::Descriptor;
use ltc831::pec;
use ltc831::regs::TAGGED;

/// Payload PEC word length.
pub const PEC_LEN: usize = 2;
/// Largest payload of one device.
pub const MAX_PAYLOAD: usize = 6;

/// ACK bitmap length for `num_devs` devices, two bits each.
pub const fn ack_len(num_devs: usize) -> usize {
    (num_devs * 2).div_ceil(8)
}

/// Frame buffer length, rounded up to whole 16 bit SPI words.
pub const FRAME_LEN: usize =
    (3 + MAX_DEVICES * (1 + MAX_PAYLOAD + PEC_LEN) + ack_len(MAX_DEVICES)).next_multiple_of(2);

/// Hooks to corrupt PECs for fault injection.
pub trait PecInjector {
    /// Payload PEC of the write block for device `dev`.
    fn tx(&mut self, _addr: u8, _dev: usize, pec: u16) -> u16 {
        pec
    }

    /// PEC check result of the response block of device `dev`.
    fn rx(&mut self, _addr: u8, _dev: usize, crc_error: bool) -> bool {
        crc_error
    }
}

/// No fault injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInjection;

impl PecInjector for NoInjection {}

/// Chain position of the device in wire slot `slot`.
///
/// `reversed` is set when the slots run from the far end of the chain.
fn position(slot: usize, num_devs: usize, reversed: bool) -> usize {
    if reversed {
        num_devs - 1 - slot
    } else {
        slot
    }
}

/// Result of an ACK bitmap check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckCheck {
    /// Devices that acknowledged.
    pub acked: u8,
    /// At least one device did not acknowledge.
    pub failed: bool,
}

pub struct Frame {
    tx: [u8; FRAME_LEN],
    rx: [u8; FRAME_LEN],
    addr: u8,
    desc: Descriptor,
    tag: Option<u8>,
    num_devs: usize,
    header: usize,
    data: usize,
    block: usize,
    len: usize,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            tx: [0; FRAME_LEN],
            rx: [0; FRAME_LEN],
            addr: 0,
            desc: ltc831::map::entries()[0],
            tag: None,
            num_devs: 0,
            header: 0,
            data: 0,
            block: 0,
            len: 0,
        }
    }
}

impl Frame {
    fn reset(&mut self, addr: u8, desc: &Descriptor, num_devs: usize) {
        self.tx.fill(0);
        self.rx.fill(0);
        self.addr = addr;
        self.desc = *desc;
        self.num_devs = num_devs;
        self.tag = None;
        self.data = 0;
        self.block = 0;
    }

    fn header(&mut self, addr: u8, tag: Option<u8>) {
        self.header = match tag {
            Some(tag) => {
                self.tx[0] = addr | TAGGED;
                self.tx[1] = tag;
                self.tx[2] = pec::command(&self.tx[..2]);
                3
            }
            None => {
                self.tx[0] = addr;
                self.tx[1] = pec::command(&self.tx[..1]);
                2
            }
        };
    }

    /// Build a read of `addr` on `num_devs` devices, optionally tagged.
    pub fn build_read(&mut self, addr: u8, desc: &Descriptor, tag: Option<u8>, num_devs: usize) {
        self.reset(addr, desc, num_devs);
        self.tag = tag;
        self.header(addr, tag);
        self.block = desc.len as usize + PEC_LEN + tag.is_some() as usize;
        self.len = self.header + num_devs * self.block;
    }

    /// Build a write of `addr` on `num_devs` devices sent from `dir`.
    ///
    /// `data` holds the register words per device in chain order from the head. They are
    /// copied into the shadow before the frame is sent and the command counters of the
    /// written register reset.
    #[allow(clippy::too_many_arguments)]
    pub fn build_write(
        &mut self,
        addr: u8,
        desc: &Descriptor,
        num_devs: usize,
        reversed: bool,
        dir: Direction,
        data: &[u16],
        shadow: &mut Shadow,
        injector: &mut impl PecInjector,
    ) -> Result<(), Error> {
        let words = desc.words();
        if data.len() < num_devs * words {
            return Err(Error::BadParameter);
        }
        self.reset(addr, desc, num_devs);
        self.header(addr, None);
        let mut pos = self.header;
        if words != 0 {
            for slot in 0..num_devs {
                let dev = position(slot, num_devs, reversed);
                let src = &data[dev * words..(dev + 1) * words];
                shadow.words_mut(dev, desc).copy_from_slice(src);
                let start = pos;
                for w in src {
                    self.tx[pos..pos + 2].copy_from_slice(&desc.encode(*w));
                    pos += 2;
                }
                let crc = injector.tx(addr, dev, pec::payload(&self.tx[start..pos]));
                self.tx[pos..pos + PEC_LEN].copy_from_slice(&pec::join(0, crc));
                pos += PEC_LEN;
                let flags = shadow.flags_mut(dev, desc);
                *flags = flags.with_cmd_count(u2::new(0)).with_dir(dir);
            }
        }
        self.data = pos - self.header;
        self.len = pos + if desc.ack { ack_len(num_devs) } else { 0 };
        Ok(())
    }

    /// Load a raw frame to be sent as is.
    pub fn load(&mut self, raw: &[u8]) -> Result<(), Error> {
        if raw.is_empty() || raw.len() > FRAME_LEN {
            return Err(Error::BadParameter);
        }
        let desc = ltc831::map::entries()[0];
        self.reset(raw[0], &desc, 0);
        self.tx[..raw.len()].copy_from_slice(raw);
        self.header = 0;
        self.len = raw.len();
        Ok(())
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Transmit buffer padded to whole SPI words and the receive buffer.
    pub fn buffers(&mut self) -> (&[u8], &mut [u8]) {
        let len = self.len.next_multiple_of(2);
        (&self.tx[..len], &mut self.rx[..len])
    }

    pub fn tx(&self) -> &[u8] {
        &self.tx[..self.len]
    }

    pub fn rx(&self) -> &[u8] {
        &self.rx[..self.len]
    }

    pub fn rx_mut(&mut self) -> &mut [u8] {
        &mut self.rx[..self.len]
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    /// Parse the read responses into the shadow.
    ///
    /// With `retry` set, blocks with a PEC error are not stored so the data of the first
    /// attempt from the other end is kept. Returns the number of good blocks.
    pub fn parse_read(
        &self,
        reversed: bool,
        dir: Direction,
        retry: bool,
        shadow: &mut Shadow,
        breaks: &mut BreakData,
        injector: &mut impl PecInjector,
    ) -> u8 {
        let desc = &self.desc;
        let mut good = 0;
        for slot in 0..self.num_devs {
            let dev = position(slot, self.num_devs, reversed);
            let start = self.header + slot * self.block;
            let block = &self.rx[start..start + self.block];
            let (body, word) = block.split_at(self.block - PEC_LEN);
            let (cc, received) = pec::split([word[0], word[1]]);
            let crc_error = injector.rx(self.addr, dev, pec::payload(body) != received);
            let (tag, payload) = match self.tag {
                Some(_) => (Some(body[0]), &body[1..]),
                None => (None, body),
            };
            let silent = crc_error && payload.iter().all(|b| *b == 0xff);

            if !crc_error || !retry {
                for (w, b) in shadow
                    .words_mut(dev, desc)
                    .iter_mut()
                    .zip(payload.chunks_exact(2))
                {
                    *w = desc.decode([b[0], b[1]]);
                }
                let flags = shadow.flags_mut(dev, desc);
                let mut f = flags
                    .with_cmd_count(u2::new(cc))
                    .with_dir(dir)
                    .with_crc_error(crc_error)
                    .with_new_data(true)
                    .with_sna(silent);
                if let (Some(expected), Some(tag)) = (self.tag, tag) {
                    f = f.with_tag_fail(tag != expected).with_tag(tag);
                }
                *flags = f;
                if silent {
                    let pec = shadow.pec_mut(dev);
                    pec.device = pec.device.saturating_add(1);
                }
            }

            if crc_error {
                breaks.crc_error = true;
                if silent {
                    breaks.silent();
                } else {
                    breaks.corrupt(slot);
                    let pec = shadow.pec_mut(dev);
                    pec.host = pec.host.saturating_add(1);
                }
            } else {
                breaks.answered(slot);
                good += 1;
            }
        }
        good
    }

    /// Check the ACK bitmap of a broadcast.
    ///
    /// With `retry` set, a missing acknowledge does not overwrite the flags of the first
    /// attempt from the other end.
    pub fn check_ack(
        &self,
        reversed: bool,
        retry: bool,
        shadow: &mut Shadow,
        breaks: &mut BreakData,
    ) -> AckCheck {
        let base = self.header + self.data;
        let mut check = AckCheck {
            acked: 0,
            failed: false,
        };
        for slot in 0..self.num_devs {
            let dev = position(slot, self.num_devs, reversed);
            let bits = (self.rx[base + slot / 4] >> (6 - 2 * (slot % 4))) & 0b11;
            let flags = shadow.flags_mut(dev, &self.desc);
            if bits != 0 {
                if !retry {
                    *flags = flags.with_ack_fail(true);
                }
                check.failed = true;
                breaks.nak();
            } else {
                *flags = flags.with_ack_fail(false);
                check.acked += 1;
                breaks.answered(slot);
            }
        }
        check
    }
}
