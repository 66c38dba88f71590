#![allow(dead_code)]
//! Simulated LTC831 chain and test bench.

use core::task::Poll;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use bmb::breaks::BreakReport;
use bmb::{
    Chain, Clock, Direction, Instant, IsoSpi, Pack, Readings, Request, RequestFlags, Response,
    Settings, Started,
};
use embedded_hal::delay::DelayNs;
use ltc831::map::{self, Kind};
use ltc831::{pec, regs, Cfg};

/// Nanosecond clock shared by the driver's delay and time base.
#[derive(Clone, Default)]
pub struct SimClock(Rc<Cell<u64>>);

impl SimClock {
    pub fn advance_ms(&self, ms: u64) {
        self.0.set(self.0.get() + ms * 1_000_000);
    }

    pub fn ms(&self) -> u64 {
        self.0.get() / 1_000_000
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> Instant {
        Instant::from_ticks(self.ms() as u32)
    }
}

impl DelayNs for SimClock {
    fn delay_ns(&mut self, ns: u32) {
        self.0.set(self.0.get() + ns as u64);
    }
}

#[derive(Debug)]
pub struct SimError;

/// A frame as seen by the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub dir: Direction,
    pub addr: u8,
    pub at_ms: u64,
}

pub struct ChainState {
    pub num_devs: usize,
    /// Register contents per device, keyed by read address.
    pub regs: Vec<HashMap<u8, Vec<u16>>>,
    /// Link broken between devices `k - 1` and `k`.
    pub break_at: Option<usize>,
    /// Devices that never answer and cut off everything behind them.
    pub dead: HashSet<usize>,
    /// Responses corrupted per (end, device, address).
    pub corrupt: HashSet<(Direction, usize, u8)>,
    /// Devices not acknowledging broadcasts.
    pub nak: HashSet<usize>,
    /// Devices answering tagged reads with a fixed tag.
    pub tags: HashMap<usize, u8>,
    /// Polls returning pending before each transfer completes.
    pub pending: u32,
    /// Select line failure.
    pub fail: bool,
    pub frames: Vec<Sent>,
    pub pulses: Vec<(Direction, u8)>,
    pub bad_writes: usize,
    selected: Direction,
    response: Vec<u8>,
    polls_left: u32,
}

impl ChainState {
    fn new(num_devs: usize) -> Self {
        let regs = (0..num_devs)
            .map(|dev| {
                map::entries()
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.kind == Kind::Read)
                    .map(|(addr, d)| {
                        let words = (0..d.words())
                            .map(|i| ((dev as u16) << 12) | ((addr as u16) << 4) | i as u16)
                            .collect();
                        (addr as u8, words)
                    })
                    .collect()
            })
            .collect();
        Self {
            num_devs,
            regs,
            break_at: None,
            dead: HashSet::new(),
            corrupt: HashSet::new(),
            nak: HashSet::new(),
            tags: HashMap::new(),
            pending: 0,
            fail: false,
            frames: Vec::new(),
            pulses: Vec::new(),
            bad_writes: 0,
            selected: Direction::A,
            response: Vec::new(),
            polls_left: 0,
        }
    }

    /// Device in wire slot `slot` counted from end `dir`. Device 0 is nearest the A end.
    fn position(&self, slot: usize, dir: Direction) -> usize {
        match dir {
            Direction::A => slot,
            Direction::B => self.num_devs - 1 - slot,
        }
    }

    fn reachable(&self, dev: usize, dir: Direction) -> bool {
        let cut = match dir {
            Direction::A => self.dead.iter().any(|d| *d <= dev),
            Direction::B => self.dead.iter().any(|d| *d >= dev),
        };
        if cut {
            return false;
        }
        match (self.break_at, dir) {
            (None, _) => true,
            (Some(k), Direction::A) => dev < k,
            (Some(k), Direction::B) => dev >= k,
        }
    }

    fn respond(&mut self, tx: &[u8]) -> Vec<u8> {
        let mut rx = vec![0; tx.len()];
        let (addr, tagged) = regs::untag(tx[0]);
        let Some(desc) = map::lookup(addr) else {
            return rx;
        };
        let n = self.num_devs;
        let dir = self.selected;
        let header = if tagged { 3 } else { 2 };
        let len = desc.len as usize;
        match desc.kind {
            Kind::Read => {
                let block = len + 2 + tagged as usize;
                for slot in 0..n {
                    let dev = self.position(slot, dir);
                    let out = &mut rx[header + slot * block..header + (slot + 1) * block];
                    if !self.reachable(dev, dir) {
                        out.fill(0xff);
                        continue;
                    }
                    let mut pos = 0;
                    if tagged {
                        out[0] = self.tags.get(&dev).copied().unwrap_or(tx[1]);
                        pos = 1;
                    }
                    for w in &self.regs[dev][&addr] {
                        out[pos..pos + 2].copy_from_slice(&desc.encode(*w));
                        pos += 2;
                    }
                    let crc = pec::payload(&out[..pos]);
                    out[pos..pos + 2].copy_from_slice(&pec::join(0, crc));
                    if self.corrupt.contains(&(dir, dev, addr)) {
                        out[pos - 1] ^= 0x01;
                    }
                }
            }
            Kind::Write => {
                let block = len + 2;
                let target = match addr {
                    0x11 => 0x10,
                    0x14 => 0x12,
                    0x15 => 0x13,
                    a => a,
                };
                for slot in 0..n {
                    // Shifted through the chain: the first block ends up farthest away.
                    let dev = self.position(n - 1 - slot, dir);
                    if !self.reachable(dev, dir) {
                        continue;
                    }
                    let start = header + slot * block;
                    let payload = &tx[start..start + len];
                    let (_, crc) = pec::split([tx[start + len], tx[start + len + 1]]);
                    if crc != pec::payload(payload) {
                        self.bad_writes += 1;
                        continue;
                    }
                    let words = payload
                        .chunks_exact(2)
                        .map(|b| desc.decode([b[0], b[1]]))
                        .collect();
                    self.regs[dev].insert(target, words);
                }
            }
            Kind::Broadcast if desc.ack => {
                for slot in 0..n {
                    let dev = self.position(slot, dir);
                    if !self.reachable(dev, dir) || self.nak.contains(&dev) {
                        rx[header + slot / 4] |= 0b11 << (6 - 2 * (slot % 4));
                    }
                }
            }
            _ => {}
        }
        rx
    }
}

/// [IsoSpi] backed by a simulated chain.
#[derive(Clone)]
pub struct SimChain {
    state: Rc<RefCell<ChainState>>,
    clock: SimClock,
}

impl SimChain {
    pub fn new(num_devs: usize, clock: SimClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChainState::new(num_devs))),
            clock,
        }
    }

    pub fn state(&self) -> RefMut<'_, ChainState> {
        self.state.borrow_mut()
    }
}

impl IsoSpi for SimChain {
    type Error = SimError;

    fn select(&mut self, dir: Direction) -> Result<(), SimError> {
        let s = &mut *self.state.borrow_mut();
        if s.fail {
            return Err(SimError);
        }
        s.selected = dir;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SimError> {
        let s = &mut *self.state.borrow_mut();
        assert_eq!(data[1], pec::command(&data[..1]));
        s.pulses.push((s.selected, data[0]));
        Ok(())
    }

    fn start(&mut self, tx: &[u8]) -> Result<(), SimError> {
        let s = &mut *self.state.borrow_mut();
        s.frames.push(Sent {
            dir: s.selected,
            addr: tx[0],
            at_ms: self.clock.ms(),
        });
        s.response = s.respond(tx);
        s.polls_left = s.pending;
        Ok(())
    }

    fn poll(&mut self, rx: &mut [u8]) -> Poll<Result<(), SimError>> {
        let s = &mut *self.state.borrow_mut();
        if s.polls_left > 0 {
            s.polls_left -= 1;
            return Poll::Pending;
        }
        rx.copy_from_slice(&s.response[..rx.len()]);
        Poll::Ready(Ok(()))
    }
}

/// Pack layer recording what it was handed.
#[derive(Default)]
pub struct Recorder {
    pub updates: usize,
    pub first_cells: Vec<u16>,
    pub report: Option<BreakReport>,
    pub discharge: Option<(usize, usize)>,
    pub fail: bool,
}

impl Pack for Recorder {
    type Error = ();

    fn update(&mut self, readings: &Readings<'_>, cfg: &mut [Cfg]) -> Result<(), ()> {
        self.updates += 1;
        self.report = Some(readings.report());
        self.first_cells = (0..readings.num_devs())
            .map(|dev| readings.cell(dev, 0).map(|r| r.value).unwrap_or(0))
            .collect();
        if let Some((dev, cell)) = self.discharge {
            cfg[dev] = cfg[dev].with_discharge(cell, true);
        }
        if self.fail {
            Err(())
        } else {
            Ok(())
        }
    }
}

pub type TestChain = Chain<SimChain, SimClock, SimClock>;

pub struct Bench {
    pub chain: TestChain,
    pub sim: SimChain,
    pub clock: SimClock,
    pub pack: Recorder,
    pub num_devs: u8,
}

impl Bench {
    pub fn new(num_devs: usize) -> Self {
        let clock = SimClock::default();
        clock.advance_ms(1);
        let sim = SimChain::new(num_devs, clock.clone());
        let chain = Chain::new(sim.clone(), clock.clone(), clock.clone(), Settings::default());
        Self {
            chain,
            sim,
            clock,
            pack: Recorder::default(),
            num_devs: num_devs as u8,
        }
    }

    /// Synchronous request flags for the whole chain sent from the A end.
    pub fn flags(&self) -> RequestFlags {
        RequestFlags::default()
            .with_num_devs(self.num_devs)
            .with_synchronous(true)
    }

    pub fn sim(&self) -> RefMut<'_, ChainState> {
        self.sim.state()
    }

    /// Start a request and tick until its response.
    pub fn run(&mut self, request: Request) -> Response {
        match self.chain.start(request).unwrap() {
            Started::Complete(response) => response,
            Started::Deferred => self.finish(),
        }
    }

    /// Tick in 1 ms steps until a response.
    pub fn finish(&mut self) -> Response {
        for _ in 0..100_000 {
            if let Some(response) = self.chain.task(&mut self.pack) {
                return response;
            }
            self.clock.advance_ms(1);
        }
        panic!("no response");
    }

    /// Tick for `ms` milliseconds expecting no response.
    pub fn idle(&mut self, ms: u64) {
        for _ in 0..ms {
            assert_eq!(self.chain.task(&mut self.pack), None);
            self.clock.advance_ms(1);
        }
    }

    /// Header bytes of the frames sent so far.
    pub fn frames(&self) -> Vec<u8> {
        self.sim().frames.iter().map(|f| f.addr).collect()
    }
}
