//! Host copy of the device registers.
//!
//! Every device in the chain has a shadow image of all its registers, laid out by the
//! register map, plus one [RegFlags] slot per register describing the last access.
use arbitrary_int::u2;
use bitbybit::bitfield;
use serde::Serialize;

use crate::transport::Direction;
use crate::MAX_DEVICES;
use ltc831::map::{Descriptor, FLAG_SLOTS, IMAGE_WORDS};

/// Status of the last access to one register of one device.
#[bitfield(u16, default = 0)]
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct RegFlags {
    /// End the data was last received from.
    #[bits(0..=0, rw)]
    pub dir: Direction,
    #[bit(1, rw)]
    pub crc_error: bool,
    #[bit(2, rw)]
    pub new_data: bool,
    /// Device command counter reported with the data.
    #[bits(3..=4, rw)]
    pub cmd_count: u2,
    /// Signal not available: the device did not answer (all ones with a bad PEC).
    #[bit(5, rw)]
    pub sna: bool,
    #[bit(6, rw)]
    pub ack_fail: bool,
    #[bit(7, rw)]
    pub tag_fail: bool,
    /// Tag returned with a tagged read.
    #[bits(8..=15, rw)]
    pub tag: u8,
}

/// PEC error counters of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PecCounts {
    /// Corrupted responses seen by the host.
    pub host: u16,
    /// Missing responses, attributed to the device.
    pub device: u16,
}

#[derive(Debug, Clone)]
struct Device {
    image: [u16; IMAGE_WORDS],
    flags: [RegFlags; FLAG_SLOTS],
    pec: PecCounts,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            image: [0; IMAGE_WORDS],
            flags: [RegFlags::default(); FLAG_SLOTS],
            pec: PecCounts::default(),
        }
    }
}

/// Shadow registers of all devices, indexed by chain position from the head.
#[derive(Debug, Clone)]
pub struct Shadow {
    devices: [Device; MAX_DEVICES],
}

impl Default for Shadow {
    fn default() -> Self {
        Self {
            devices: core::array::from_fn(|_| Device::default()),
        }
    }
}

impl Shadow {
    /// Register words of device `dev`.
    pub fn words(&self, dev: usize, desc: &Descriptor) -> &[u16] {
        let start = desc.word();
        &self.devices[dev].image[start..start + desc.words()]
    }

    pub fn words_mut(&mut self, dev: usize, desc: &Descriptor) -> &mut [u16] {
        let start = desc.word();
        &mut self.devices[dev].image[start..start + desc.words()]
    }

    pub fn flags(&self, dev: usize, desc: &Descriptor) -> RegFlags {
        self.devices[dev].flags[desc.flag as usize]
    }

    pub fn flags_mut(&mut self, dev: usize, desc: &Descriptor) -> &mut RegFlags {
        &mut self.devices[dev].flags[desc.flag as usize]
    }

    pub fn pec(&self, dev: usize) -> PecCounts {
        self.devices[dev].pec
    }

    pub fn pec_mut(&mut self, dev: usize) -> &mut PecCounts {
        &mut self.devices[dev].pec
    }

    /// Clear the flags of one register on the first `num_devs` devices.
    pub fn clear(&mut self, desc: &Descriptor, num_devs: usize) {
        for dev in self.devices.iter_mut().take(num_devs) {
            dev.flags[desc.flag as usize] = RegFlags::default();
        }
    }

    /// Zero all images, flags and counters.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltc831::map::lookup;
    use ltc831::Opcode;

    #[test]
    fn flags_layout() {
        let f = RegFlags::default()
            .with_dir(Direction::B)
            .with_cmd_count(u2::new(3))
            .with_sna(true)
            .with_tag(0xa5);
        assert_eq!(f.raw_value(), 0xa539);
        assert_eq!(RegFlags::new_with_raw_value(0xa539).tag(), 0xa5);
    }

    #[test]
    fn registers_are_separate() {
        let mut shadow = Shadow::default();
        let aux = lookup(Opcode::RdAuxA.into()).unwrap();
        let cfg = lookup(Opcode::RdCfg.into()).unwrap();
        shadow.words_mut(2, aux).copy_from_slice(&[1, 2, 3]);
        *shadow.flags_mut(2, aux) = RegFlags::default().with_new_data(true);
        assert_eq!(shadow.words(2, aux), &[1, 2, 3]);
        assert_eq!(shadow.words(1, aux), &[0, 0, 0]);
        assert_eq!(shadow.words(2, cfg), &[0, 0]);
        assert!(shadow.flags(2, aux).new_data());
        assert!(!shadow.flags(2, cfg).new_data());

        shadow.clear(aux, 2);
        assert!(shadow.flags(2, aux).new_data());
        shadow.clear(aux, 3);
        assert!(!shadow.flags(2, aux).new_data());
        assert_eq!(shadow.words(2, aux), &[1, 2, 3]);

        shadow.pec_mut(0).host += 1;
        shadow.reset();
        assert_eq!(shadow.pec(0), PecCounts::default());
        assert_eq!(shadow.words(2, aux), &[0, 0, 0]);
    }
}
