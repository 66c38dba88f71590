//! Register map descriptor table.
//!
//! # Design
//! Every encoding and decoding decision of the protocol engine is taken from this table:
//! register kind, payload length, byte order of the payload words, whether the command
//! increments the device command counter, whether the device acknowledges it, the per-device
//! flag slot and the byte offset into the shadow register image.
//!
//! Entry 0 is reserved so that opcodes index the table directly. Entries `0x00..=0x35` are the
//! command opcodes. The four trailing entries hold the fuse row write images; they have no
//! opcode of their own.

/// Register kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unused,
    /// Readable register.
    Read,
    /// Writable register.
    Write,
    /// Broadcast command without payload.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub kind: Kind,
    /// Payload length per device in bytes (0, 2, 4 or 6).
    pub len: u8,
    /// Payload words are transmitted low byte first.
    pub swap: bool,
    /// The device increments its command counter on this command.
    pub cc_inc: bool,
    /// The device acknowledges this command.
    pub ack: bool,
    /// Per-device register flag slot.
    pub flag: u8,
    /// Byte offset of the first item in the shadow register image.
    pub offset: u8,
}

/// Shadow register image size in words.
pub const IMAGE_WORDS: usize = 64;
/// Number of register flag slots.
pub const FLAG_SLOTS: usize = 33;
/// Flag slot shared by unused entries and broadcasts.
pub const SHARED_FLAG: u8 = 32;
/// Number of table entries.
pub const ENTRIES: usize = 58;

const fn unused() -> Descriptor {
    Descriptor {
        kind: Kind::Unused,
        len: 0,
        swap: false,
        cc_inc: false,
        ack: false,
        flag: SHARED_FLAG,
        offset: 0,
    }
}

const fn read(len: u8, swap: bool, flag: u8, word: u8) -> Descriptor {
    Descriptor {
        kind: Kind::Read,
        len,
        swap,
        cc_inc: false,
        ack: false,
        flag,
        offset: word * 2,
    }
}

const fn write(len: u8, swap: bool, flag: u8, word: u8) -> Descriptor {
    Descriptor {
        kind: Kind::Write,
        len,
        swap,
        cc_inc: true,
        ack: false,
        flag,
        offset: word * 2,
    }
}

const fn broadcast(cc_inc: bool, ack: bool) -> Descriptor {
    Descriptor {
        kind: Kind::Broadcast,
        len: 0,
        swap: false,
        cc_inc,
        ack,
        flag: SHARED_FLAG,
        offset: 0,
    }
}

const U: Descriptor = unused();
const B: Descriptor = broadcast(true, true);

#[rustfmt::skip]
static MAP: [Descriptor; ENTRIES] = [
    U,
    // CVA..CVF
    read(6, true, 1, 0), read(6, true, 2, 3), read(6, true, 3, 6),
    read(6, true, 4, 9), read(6, true, 5, 12), read(4, true, 6, 15),
    // SNA..SNF
    read(6, true, 7, 17), read(6, true, 8, 20), read(6, true, 9, 23),
    read(6, true, 10, 26), read(6, true, 11, 29), read(4, true, 12, 32),
    // AUXA, AUXB
    read(6, true, 13, 34), read(6, true, 14, 37),
    // STATUS, CFG
    read(4, false, 15, 40), read(4, false, 16, 42), write(4, false, 17, 44),
    // PWMA/PWMB read, PWMA/PWMB write
    read(4, true, 18, 46), read(4, true, 20, 50),
    write(4, true, 19, 48), write(4, true, 21, 52),
    // 0x16..=0x1f
    U, U, U, U, U, U, U, U, U, U,
    // MUTE, UNMUTE, PRIMEZ, PRIMEN
    B, B, B, B,
    // CLRDIAG
    broadcast(true, false),
    // TEST5, TESTA, TESTOFF, ARMSOLO, DISSOLO
    B, B, B, B, B,
    // CLRCNT
    broadcast(false, true),
    // SNAP
    B,
    // 0x2c..=0x2f
    U, U, U, U,
    // Fuse rows 0..=5
    read(2, true, 22, 54), read(2, true, 23, 55), read(2, true, 24, 56),
    read(2, true, 25, 57), read(2, true, 26, 58), read(2, true, 27, 59),
    // Fuse row write images 0..=3
    write(2, false, 28, 60), write(2, false, 29, 61),
    write(2, false, 30, 62), write(2, false, 31, 63),
];

/// Look up the descriptor of a table entry.
pub fn lookup(addr: u8) -> Option<&'static Descriptor> {
    MAP.get(addr as usize)
}

/// All table entries in address order.
pub fn entries() -> &'static [Descriptor] {
    &MAP
}

impl Descriptor {
    /// Word index of the first item in the shadow register image.
    pub fn word(&self) -> usize {
        self.offset as usize / 2
    }

    /// Payload length in words.
    pub fn words(&self) -> usize {
        self.len as usize / 2
    }

    /// Decode one payload word from its two wire bytes.
    pub fn decode(&self, bytes: [u8; 2]) -> u16 {
        if self.swap {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        }
    }

    /// Encode one payload word into its two wire bytes.
    pub fn encode(&self, word: u16) -> [u8; 2] {
        if self.swap {
            word.to_le_bytes()
        } else {
            word.to_be_bytes()
        }
    }
}
