use arbitrary_int::{u11, u4, u5, u6};
use bitbybit::{bitenum, bitfield};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Command opcodes (untagged form).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Opcode {
    RdCvA = 0x01,
    RdCvB = 0x02,
    RdCvC = 0x03,
    RdCvD = 0x04,
    RdCvE = 0x05,
    RdCvF = 0x06,
    RdSnA = 0x07,
    RdSnB = 0x08,
    RdSnC = 0x09,
    RdSnD = 0x0a,
    RdSnE = 0x0b,
    RdSnF = 0x0c,
    RdAuxA = 0x0d,
    RdAuxB = 0x0e,
    RdStat = 0x0f,
    RdCfg = 0x10,
    WrCfg = 0x11,
    RdPwmA = 0x12,
    RdPwmB = 0x13,
    WrPwmA = 0x14,
    WrPwmB = 0x15,
    Mute = 0x20,
    Unmute = 0x21,
    PrimeZ = 0x22,
    PrimeN = 0x23,
    ClrDiag = 0x24,
    Test5 = 0x25,
    TestA = 0x26,
    TestOff = 0x27,
    ArmSolo = 0x28,
    DisSolo = 0x29,
    ClrCnt = 0x2a,
    Snap = 0x2b,
    RdFs0 = 0x30,
    RdFs1 = 0x31,
    RdFs2 = 0x32,
    RdFs3 = 0x33,
    RdFs4 = 0x34,
    RdFs5 = 0x35,
}

/// Bit marking a tagged read (`0x41..=0x50`, `0x70..=0x75`).
pub const TAGGED: u8 = 0x40;
/// Fuse row read base opcode, the row is added to it.
pub const FUSE_ROW_BASE: u8 = 0x30;
/// Last readable fuse row.
pub const FUSE_ROW_END: u8 = 5;
/// Fuse row carrying the module ID.
pub const MODULE_ID_ROW: u8 = 3;

impl Opcode {
    /// Fuse row read opcode.
    pub fn fuse_row(row: u8) -> Option<Self> {
        if row > FUSE_ROW_END {
            None
        } else {
            Self::try_from(FUSE_ROW_BASE + row).ok()
        }
    }

    /// The tagged form of a read opcode.
    pub fn tagged(self) -> u8 {
        u8::from(self) | TAGGED
    }
}

/// Split a possibly tagged read opcode into its untagged address and the tag flag.
///
/// Only addresses whose untagged form is a read can carry the tag bit.
pub fn untag(addr: u8) -> (u8, bool) {
    let base = addr & !TAGGED;
    let read = matches!(base, 0x01..=0x10 | 0x12 | 0x13)
        || (FUSE_ROW_BASE..=FUSE_ROW_BASE + FUSE_ROW_END).contains(&base);
    if addr & TAGGED != 0 && read {
        (base, true)
    } else {
        (addr, false)
    }
}

/// Number of cells measured by one device.
pub const CELLS: usize = 16;
/// Number of thermistor inputs of one device.
pub const TEMPS: usize = 2;
/// Items in each of the A..E cell and snapshot groups.
pub const ITEMS_PER_GROUP: usize = 3;

/// AUXA item index of the first thermistor.
pub const AUXA_TEMP1: usize = 0;
/// AUXA item index of the 5 V regulator.
pub const AUXA_V5: usize = 1;
/// AUXA item index of the second thermistor.
pub const AUXA_TEMP2: usize = 2;
/// AUXB item index of the 3 V regulator.
pub const AUXB_V3: usize = 0;
/// AUXB item index of the die temperature diode.
pub const AUXB_VDIODE: usize = 1;
/// AUXB item index of the second reference.
pub const AUXB_REF2: usize = 2;
/// CVF/SNF item index of the stack voltage.
pub const CVF_STACK: usize = 1;

#[bitenum(u3, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum Filter {
    Off = 0,
    Hz23 = 1,
    Hz11 = 2,
    #[default]
    Hz6 = 3,
    Hz3 = 4,
    Hz2 = 5,
    Hz1 = 6,
    Hz0p4 = 7,
}

/// Configuration register, composed of the two shadow words (low word first).
#[bitfield(u32, default = 0x0000_0003)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cfg {
    #[bits(0..=2, rw)]
    pub filt: Filter,
    #[bit(3, rw)]
    pub rand: bool,
    #[bits(4..=7, rw)]
    pub tsolo: u4,
    #[bit(8, rw)]
    pub mod_dis: bool,
    #[bit(9, rw)]
    pub try_flag: bool,
    #[bit(10, rw)]
    pub spare: bool,
    #[bit(11, rw)]
    pub temp_ow: bool,
    /// Discharge timeout.
    #[bits(12..=15, rw)]
    pub dct0: u4,
    /// Discharge enables, bit n is cell n + 1.
    #[bits(16..=31, rw)]
    pub dcc: u16,
}

impl Cfg {
    pub fn from_words(words: [u16; 2]) -> Self {
        Self::new_with_raw_value(words[0] as u32 | (words[1] as u32) << 16)
    }

    pub fn words(&self) -> [u16; 2] {
        let v = self.raw_value();
        [v as u16, (v >> 16) as u16]
    }

    pub fn discharge(&self, cell: usize) -> bool {
        cell < CELLS && self.dcc() & (1 << cell) != 0
    }

    pub fn with_discharge(self, cell: usize, on: bool) -> Self {
        if cell >= CELLS {
            return self;
        }
        let dcc = if on {
            self.dcc() | (1 << cell)
        } else {
            self.dcc() & !(1 << cell)
        };
        self.with_dcc(dcc)
    }
}

/// Status register, composed of the two shadow words (low word first).
#[bitfield(u32)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[bit(0, r)]
    pub por: bool,
    #[bit(1, r)]
    pub solo_flag: bool,
    #[bit(4, r)]
    pub mux_fail: bool,
    #[bit(5, r)]
    pub thsd_flag: bool,
    #[bit(6, r)]
    pub cec_fail: bool,
    #[bit(7, r)]
    pub cmd_fail: bool,
    #[bit(8, r)]
    pub test5: bool,
    #[bit(9, r)]
    pub testa: bool,
    #[bit(10, r)]
    pub adc_min: bool,
    #[bit(11, r)]
    pub adc_max: bool,
    #[bits(12..=15, r)]
    pub rev: u4,
    #[bit(16, r)]
    pub mute: bool,
    #[bit(17, r)]
    pub sense: bool,
    #[bit(18, r)]
    pub solo_armed: bool,
    #[bit(19, r)]
    pub thsd: bool,
    #[bit(20, r)]
    pub lotp_ed: bool,
    #[bit(21, r)]
    pub lotp_med: bool,
    #[bit(22, r)]
    pub totp_ed: bool,
    #[bit(23, r)]
    pub totp_med: bool,
    #[bits(24..=31, r)]
    pub filt_cnt: u8,
}

impl Status {
    pub fn from_words(words: [u16; 2]) -> Self {
        Self::new_with_raw_value(words[0] as u32 | (words[1] as u32) << 16)
    }
}

/// Balancing PWM duty cycles for eight cells (PWMA: cells 1..8, PWMB: cells 9..16).
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pwm {
    #[bits(0..=3, rw, stride = 4)]
    pub duty: [u4; 8],
}

impl Pwm {
    pub fn from_words(words: [u16; 2]) -> Self {
        Self::new_with_raw_value(words[0] as u32 | (words[1] as u32) << 16)
    }

    pub fn words(&self) -> [u16; 2] {
        let v = self.raw_value();
        [v as u16, (v >> 16) as u16]
    }
}

#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseRow0 {
    #[bit(0, r)]
    pub tsla_lck: bool,
    #[bit(1, r)]
    pub array_sel: bool,
    #[bits(2..=5, r)]
    pub solo_to: u4,
    #[bits(6..=10, r)]
    pub ref_trim: u5,
    #[bits(11..=15, r)]
    pub otp_crc: u5,
}

#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseRow1 {
    #[bits(0..=5, r)]
    pub ot_ext: u6,
    #[bits(6..=10, r)]
    pub ot_int: u5,
    #[bits(11..=15, r)]
    pub otp_crc: u5,
}

#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseRow2 {
    #[bits(0..=4, r)]
    pub solo_uv: u5,
    #[bits(5..=8, r)]
    pub ncells: u4,
    #[bits(11..=15, r)]
    pub otp_crc: u5,
}

/// Fuse row 3: module ID.
#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseRow3 {
    #[bits(0..=10, r)]
    pub mod_id: u11,
    #[bits(11..=15, r)]
    pub otp_crc: u5,
}

/// Fuse rows 4 and 5: the low and high halves of the die ID.
#[bitfield(u16)]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseDieId {
    #[bits(0..=10, r)]
    pub die_id: u11,
    #[bits(11..=15, r)]
    pub otp_crc: u5,
}

/// Assemble the 22 bit die ID from fuse rows 4 (low) and 5 (high).
pub fn die_id(low: FuseDieId, high: FuseDieId) -> u32 {
    low.die_id().value() as u32 | (high.die_id().value() as u32) << 11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values() {
        assert_eq!(u8::from(Opcode::Snap), 0x2b);
        assert_eq!(Opcode::try_from(0x11), Ok(Opcode::WrCfg));
        assert!(Opcode::try_from(0x16).is_err());
        assert_eq!(Opcode::fuse_row(MODULE_ID_ROW), Some(Opcode::RdFs3));
        assert_eq!(Opcode::fuse_row(6), None);
        assert_eq!(Opcode::RdAuxA.tagged(), 0x4d);
        assert_eq!(Opcode::RdFs0.tagged(), 0x70);
    }

    #[test]
    fn untagging() {
        assert_eq!(untag(0x4d), (0x0d, true));
        assert_eq!(untag(0x50), (0x10, true));
        assert_eq!(untag(0x73), (0x33, true));
        assert_eq!(untag(0x0d), (0x0d, false));
        // WRCFG has no tagged form.
        assert_eq!(untag(0x51), (0x51, false));
        assert_eq!(untag(0x76), (0x76, false));
    }

    #[test]
    fn cfg_words() {
        let cfg = Cfg::default()
            .with_filt(Filter::Hz1)
            .with_rand(true)
            .with_discharge(0, true)
            .with_discharge(15, true);
        assert_eq!(cfg.words(), [0x000e, 0x8001]);
        assert_eq!(Cfg::from_words(cfg.words()), cfg);
        assert!(cfg.discharge(15));
        assert!(!cfg.discharge(14));
        assert!(!cfg.discharge(16));
        assert_eq!(Cfg::default().filt(), Filter::Hz6);
    }

    #[test]
    fn status_fields() {
        let sta = Status::from_words([0x3081, 0x5a01]);
        assert!(sta.por());
        assert!(sta.cmd_fail());
        assert_eq!(sta.rev(), u4::new(3));
        assert!(sta.mute());
        assert!(!sta.sense());
        assert_eq!(sta.filt_cnt(), 0x5a);
    }

    #[test]
    fn pwm_nibbles() {
        let pwm = Pwm::default().with_duty(0, u4::new(0xf)).with_duty(7, u4::new(0x3));
        assert_eq!(pwm.words(), [0x000f, 0x3000]);
        assert_eq!(Pwm::from_words(pwm.words()).duty(7), u4::new(3));
    }

    #[test]
    fn fuse_rows() {
        let row = FuseRow3::new_with_raw_value(0xf9a5);
        assert_eq!(row.mod_id(), u11::new(0x1a5));
        assert_eq!(row.otp_crc(), u5::new(0x1f));
        let id = die_id(
            FuseDieId::new_with_raw_value(0x0001),
            FuseDieId::new_with_raw_value(0x0002),
        );
        assert_eq!(id, 1 | 2 << 11);
    }
}
