//! Chain driver.
//!
//! # Design
//! [Chain] owns the link, the shadow registers and the frame buffers. It is driven by two
//! calls from the host main loop: [Chain::start] accepts a request from the transaction layer
//! and [Chain::task] advances the state machine by at most one transfer and returns the
//! response once the request completes.
//!
//! A tick does work when a transfer completion is outstanding, a state asked to be re-entered
//! or the state timer expired. The state timer paces the sleep wake ladder, the bit error rate
//! runs and the back-off after transport failures.
//!
//! States that need the devices awake go through `Wakeup` first and come back through the
//! return slot. A poll cycle runs its phases in fixed order, one transfer per tick:
//! MUTE from both ends (active balancing only), AUXA, AUXB, PRIMEN (active balancing only),
//! CFG, SNAP, STATUS, SNA..SNF, UNMUTE (active balancing only), the module ID fuse row, the
//! pack update and the configuration write back.
use core::mem::{discriminant, Discriminant};
use core::task::{ready, Poll};

use embedded_hal::delay::DelayNs;
use fugit::ExtU32;
use heapless::Vec;

use crate::breaks::{BreakReport, Breaks, Outcome};
use crate::convert::{CellCode, DieTempCode, StackCode, XyTable, NTC_10K};
use crate::frame::{Frame, NoInjection, PecInjector};
use crate::request::{
    BerMode, Body, Command, Diag, DiagFlags, ErrorCounts, Readback, Request,
    RequestFlags, Response, ResponseFlags, Started, MAX_WRITE_WORDS,
};
use crate::settings::Settings;
use crate::shadow::{RegFlags, Shadow};
use crate::transport::{Clock, Direction, IsoSpi, Link, Timer, T_LADDER};
use crate::{Error, Status, MAX_DEVICES, VERSION};
use ltc831::map::{self, Descriptor, Kind};
use ltc831::regs::{self, Cfg, FuseRow3, Opcode, FUSE_ROW_BASE, FUSE_ROW_END};

const AUX: [Opcode; 2] = [Opcode::RdAuxA, Opcode::RdAuxB];
const SNAPSHOT: [Opcode; 7] = [
    Opcode::RdStat,
    Opcode::RdSnA,
    Opcode::RdSnB,
    Opcode::RdSnC,
    Opcode::RdSnD,
    Opcode::RdSnE,
    Opcode::RdSnF,
];

/// Poll cycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Mute { second: bool },
    Aux(usize),
    PrimeN,
    Config,
    Snap,
    Snapshot(usize),
    Unmute,
    ModuleId,
    Pack,
    WriteCfg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Sleep wake ladder, counting the pulses sent from the current end.
    Wakeup {
        pulses: u8,
    },
    Passthrough,
    RegRead,
    RegWrite,
    DevPoll(Phase),
    Ber,
    CommandComplete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// First init after power on reset.
    PowerOn,
    Reset,
}

/// Consumer of the readings of every poll cycle.
pub trait Pack {
    type Error: core::fmt::Debug;

    /// Called once per poll cycle after all registers have been read.
    ///
    /// `cfg` holds the configuration of each device in the chain. It is written back at the end
    /// of the cycle.
    fn update(&mut self, readings: &Readings<'_>, cfg: &mut [Cfg]) -> Result<(), Self::Error>;
}

impl Pack for () {
    type Error = core::convert::Infallible;

    fn update(&mut self, _readings: &Readings<'_>, _cfg: &mut [Cfg]) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A converted value and the flags of the register it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading<T> {
    pub value: T,
    pub flags: RegFlags,
}

impl<T> Reading<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        Reading {
            value: f(self.value),
            flags: self.flags,
        }
    }
}

/// Shadow register contents in engineering units.
pub struct Readings<'a> {
    shadow: &'a Shadow,
    settings: &'a Settings,
    therm: XyTable<'a>,
    report: BreakReport,
    num_devs: usize,
}

impl<'a> Readings<'a> {
    fn register(&self, dev: usize, op: Opcode) -> Result<(&'a [u16], RegFlags), Error> {
        if dev >= MAX_DEVICES {
            return Err(Error::BadParameter);
        }
        let desc = map::lookup(op.into()).ok_or(Error::UnexpectedCommand)?;
        Ok((self.shadow.words(dev, desc), self.shadow.flags(dev, desc)))
    }

    fn item(&self, dev: usize, op: Opcode, idx: usize) -> Result<Reading<u16>, Error> {
        let (words, flags) = self.register(dev, op)?;
        let value = *words.get(idx).ok_or(Error::BadParameter)?;
        Ok(Reading { value, flags })
    }

    fn pair(&self, dev: usize, op: Opcode) -> Result<Reading<[u16; 2]>, Error> {
        let (words, flags) = self.register(dev, op)?;
        match words {
            [low, high] => Ok(Reading {
                value: [*low, *high],
                flags,
            }),
            _ => Err(Error::UnexpectedCommand),
        }
    }

    fn voltage(&self, dev: usize, op: Opcode, idx: usize) -> Result<Reading<u16>, Error> {
        let brick = self.settings.brick_uv_b;
        Ok(self.item(dev, op, idx)?.map(|v| CellCode(v).scale(brick)))
    }

    /// Number of devices in the chain.
    pub fn num_devs(&self) -> usize {
        self.num_devs
    }

    /// Break flags of the last poll cycle.
    pub fn report(&self) -> BreakReport {
        self.report
    }

    /// Snapshot cell voltage, scaled to the brick resolution.
    pub fn cell(&self, dev: usize, cell: usize) -> Result<Reading<u16>, Error> {
        if cell >= regs::CELLS {
            return Err(Error::BadParameter);
        }
        let group = (cell / regs::ITEMS_PER_GROUP) as u8;
        let op = Opcode::try_from(u8::from(Opcode::RdSnA) + group)
            .map_err(|_| Error::BadParameter)?;
        self.voltage(dev, op, cell % regs::ITEMS_PER_GROUP)
    }

    /// Thermistor temperature in 0.1 °C.
    pub fn temp(&self, dev: usize, idx: usize) -> Result<Reading<i16>, Error> {
        let item = match idx {
            0 => regs::AUXA_TEMP1,
            1 => regs::AUXA_TEMP2,
            _ => return Err(Error::BadParameter),
        };
        let offset = self.settings.therm_offset;
        Ok(self
            .item(dev, Opcode::RdAuxA, item)?
            .map(|v| self.therm.lookup(v).saturating_sub(offset)))
    }

    /// Die temperature in 0.1 °C.
    pub fn die_temp(&self, dev: usize) -> Result<Reading<i16>, Error> {
        Ok(self
            .item(dev, Opcode::RdAuxB, regs::AUXB_VDIODE)?
            .map(|v| i16::from(DieTempCode(v))))
    }

    /// Stack voltage, scaled to the stack resolution.
    pub fn stack(&self, dev: usize) -> Result<Reading<u32>, Error> {
        let stack = self.settings.stack_uv_b;
        Ok(self
            .item(dev, Opcode::RdSnF, regs::CVF_STACK)?
            .map(|v| StackCode(v).scale(stack)))
    }

    pub fn v3(&self, dev: usize) -> Result<Reading<u16>, Error> {
        self.voltage(dev, Opcode::RdAuxB, regs::AUXB_V3)
    }

    pub fn v5(&self, dev: usize) -> Result<Reading<u16>, Error> {
        self.voltage(dev, Opcode::RdAuxA, regs::AUXA_V5)
    }

    pub fn ref2(&self, dev: usize) -> Result<Reading<u16>, Error> {
        self.voltage(dev, Opcode::RdAuxB, regs::AUXB_REF2)
    }

    /// Configuration as read back from the device.
    pub fn read_cfg(&self, dev: usize) -> Result<Reading<Cfg>, Error> {
        Ok(self.pair(dev, Opcode::RdCfg)?.map(Cfg::from_words))
    }

    pub fn status(&self, dev: usize) -> Result<Reading<regs::Status>, Error> {
        Ok(self.pair(dev, Opcode::RdStat)?.map(regs::Status::from_words))
    }

    pub fn module_id(&self, dev: usize) -> Result<Reading<FuseRow3>, Error> {
        Ok(self
            .item(dev, Opcode::RdFs3, 0)?
            .map(FuseRow3::new_with_raw_value))
    }

    pub fn error_stats(&self, dev: usize) -> Result<ErrorCounts, Error> {
        if dev >= MAX_DEVICES {
            return Err(Error::BadParameter);
        }
        Ok(self.shadow.pec(dev).into())
    }
}

/// Bit error rate run parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Ber {
    flags: DiagFlags,
    time: u16,
    delta: u16,
}

impl Ber {
    /// Current interval. Then advance the sweep, turning around at `min` and `max`.
    fn step(&mut self, min: u16, max: u16) -> u16 {
        let current = self.time;
        if self.flags.mode() == BerMode::Fixed {
            return current;
        }
        if self.flags.rising() {
            let next = self.time.saturating_add(self.delta);
            if next >= max {
                self.time = max;
                self.flags = self.flags.with_rising(false);
            } else {
                self.time = next;
            }
        } else {
            let next = self.time.saturating_sub(self.delta);
            if next <= min {
                self.time = min;
                self.flags = self.flags.with_rising(true);
            } else {
                self.time = next;
            }
        }
        current
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Access {
    tag: Option<u8>,
    /// Retry from the other end on failure and classify breaks.
    break_detect: bool,
    /// Check the ACK bitmap.
    ack: bool,
    /// Return the register contents in the response.
    collect: bool,
}

fn readable(addr: u8) -> Result<&'static Descriptor, Error> {
    if addr > FUSE_ROW_BASE + FUSE_ROW_END {
        return Err(Error::UnsupportedFeature);
    }
    match map::lookup(addr) {
        Some(desc) if desc.kind == Kind::Read => Ok(desc),
        _ => Err(Error::InvalidCommand),
    }
}

fn writable(addr: u8) -> Result<&'static Descriptor, Error> {
    if addr >= FUSE_ROW_BASE {
        return Err(Error::UnsupportedFeature);
    }
    match map::lookup(addr) {
        Some(desc) if matches!(desc.kind, Kind::Write | Kind::Broadcast) => Ok(desc),
        _ => Err(Error::BadParameter),
    }
}

/// Errors that do not abort a poll cycle. The first one is reported at its end.
fn sticky(e: Error) -> bool {
    matches!(e, Error::AckFailed | Error::PackFailure)
}

/// Driver of one LTC831 daisy chain.
pub struct Chain<S, D, C, I = NoInjection> {
    link: Link<S, D, C>,
    inject: I,
    settings: Settings,
    therm: XyTable<'static>,
    shadow: Shadow,
    write_cfg: [Cfg; MAX_DEVICES],
    frame: Frame,
    breaks: Breaks,
    report: BreakReport,

    state: State,
    prev: Option<Discriminant<State>>,
    return_state: Option<State>,
    poll_timer: Timer,
    new_entry: bool,
    did_first: bool,
    did_return: bool,

    flags: RequestFlags,
    tag: u8,
    addr: u8,
    data: Vec<u16, MAX_WRITE_WORDS>,
    dir: Direction,
    head: Direction,
    outcome: Result<(), Error>,
    body: Body,
    rx_num_devs: u8,
    tag_error: bool,

    active_balance: bool,
    por: bool,
    cycle_count: u32,
    ber: Ber,
}

impl<S: IsoSpi, D: DelayNs, C: Clock> Chain<S, D, C, NoInjection> {
    pub fn new(spi: S, delay: D, clock: C, settings: Settings) -> Self {
        Self::with_injector(spi, delay, clock, settings, NoInjection)
    }
}

impl<S: IsoSpi, D: DelayNs, C: Clock, I: PecInjector> Chain<S, D, C, I> {
    /// Create a driver with PEC fault injection hooks.
    pub fn with_injector(spi: S, delay: D, clock: C, settings: Settings, inject: I) -> Self {
        let head = settings.chain_head;
        let mut chain = Self {
            link: Link::new(spi, delay, clock),
            inject,
            settings,
            therm: NTC_10K,
            shadow: Shadow::default(),
            write_cfg: [Cfg::new_with_raw_value(0); MAX_DEVICES],
            frame: Frame::default(),
            breaks: Breaks::default(),
            report: BreakReport::default(),
            state: State::Idle,
            prev: None,
            return_state: None,
            poll_timer: Timer::Expired,
            new_entry: false,
            did_first: false,
            did_return: false,
            flags: RequestFlags::default(),
            tag: 0,
            addr: 0,
            data: Vec::new(),
            dir: head,
            head,
            outcome: Ok(()),
            body: Body::None,
            rx_num_devs: 0,
            tag_error: false,
            active_balance: false,
            por: true,
            cycle_count: 0,
            ber: Ber::default(),
        };
        chain.init(InitMode::PowerOn, head);
        chain
    }

    /// Reset all state. Both ends are considered asleep so that the first request wakes the
    /// chain.
    pub fn init(&mut self, mode: InitMode, chain_head: Direction) {
        log::info!("Chain init ({mode:?}), head at {chain_head:?}");
        self.link.reset();
        self.settings.chain_head = chain_head;
        self.head = chain_head;
        self.por = mode == InitMode::PowerOn;
        self.shadow.reset();
        self.write_cfg = [Cfg::new_with_raw_value(0); MAX_DEVICES];
        self.breaks = Breaks::default();
        self.report = BreakReport::default();
        self.state = State::Idle;
        self.prev = None;
        self.return_state = None;
        self.poll_timer.expire();
        self.new_entry = false;
        self.did_first = false;
        self.did_return = false;
        self.flags = RequestFlags::default();
        self.data.clear();
        self.dir = chain_head;
        self.outcome = Ok(());
        self.body = Body::None;
        self.rx_num_devs = 0;
        self.tag_error = false;
        self.active_balance = false;
        self.cycle_count = 0;
        self.ber = Ber::default();
    }

    /// The last init followed a power on reset.
    pub fn power_on(&self) -> bool {
        self.por
    }

    pub fn version() -> &'static str {
        VERSION
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Replace the thermistor lookup table.
    pub fn set_thermistor(&mut self, table: XyTable<'static>) {
        self.therm = table;
    }

    pub fn set_active_balance(&mut self, enable: bool) {
        self.active_balance = enable;
    }

    pub fn active_balance(&self) -> bool {
        self.active_balance
    }

    /// Set the configuration written back to device `dev` at the end of every poll cycle.
    pub fn set_write_cfg(&mut self, dev: usize, cfg: Cfg) -> Result<(), Error> {
        *self.write_cfg.get_mut(dev).ok_or(Error::BadParameter)? = cfg;
        Ok(())
    }

    pub fn write_cfg(&self, dev: usize) -> Result<Cfg, Error> {
        self.write_cfg.get(dev).copied().ok_or(Error::BadParameter)
    }

    pub fn readings(&self) -> Readings<'_> {
        Readings {
            shadow: &self.shadow,
            settings: &self.settings,
            therm: self.therm,
            report: self.report,
            num_devs: self.flags.num_devs() as usize,
        }
    }

    /// Flags of register `op` of device `dev`.
    pub fn flags(&self, dev: usize, op: Opcode) -> Result<RegFlags, Error> {
        let desc = map::lookup(op.into()).ok_or(Error::UnexpectedCommand)?;
        if dev >= MAX_DEVICES {
            return Err(Error::BadParameter);
        }
        Ok(self.shadow.flags(dev, desc))
    }

    pub fn link(&self) -> &Link<S, D, C> {
        &self.link
    }

    /// Accept a request.
    ///
    /// Diagnostic requests and init complete immediately. Any other request is only accepted
    /// while idle and completes in a later [Chain::task].
    pub fn start(&mut self, request: Request) -> Result<Started, Error> {
        let Request {
            command,
            mut flags,
            tag,
        } = request;
        if flags.num_devs() as usize > MAX_DEVICES {
            return Err(Error::BadParameter);
        }

        let next = match command {
            Command::Diag(diag) => return Ok(Started::Complete(self.diag(diag, flags))),
            _ if self.state != State::Idle => return Err(Error::Busy),
            Command::Init => {
                return Ok(Started::Complete(Response {
                    status: Status::Success,
                    flags: ResponseFlags::default().with_dir(flags.dir()),
                    body: Body::None,
                }))
            }
            Command::Passthrough(raw) => {
                self.frame.load(&raw)?;
                State::Passthrough
            }
            Command::RegRead { addr } => {
                let (addr, tagged) = regs::untag(addr);
                if tagged {
                    flags = flags.with_use_tag(true);
                }
                self.addr = addr;
                State::RegRead
            }
            Command::RegWrite { addr, data } => {
                if addr == u8::from(Opcode::WrCfg) {
                    let n = flags.num_devs() as usize;
                    for (cfg, w) in self.write_cfg.iter_mut().zip(data.chunks_exact(2)).take(n) {
                        *cfg = Cfg::from_words([w[0], w[1]]);
                    }
                }
                self.addr = addr;
                self.data = data;
                State::RegWrite
            }
            Command::Convert => State::DevPoll(Phase::Mute { second: false }),
        };

        self.begin(flags, tag);
        if self.link.asleep(self.dir) {
            self.return_state = Some(next);
            self.state = State::Wakeup { pulses: 0 };
        } else {
            self.state = next;
        }
        log::debug!("Started {:?}", self.state);
        Ok(Started::Deferred)
    }

    fn begin(&mut self, flags: RequestFlags, tag: u8) {
        self.flags = flags;
        self.tag = tag;
        self.dir = flags.dir();
        self.outcome = Ok(());
        self.body = Body::None;
        self.rx_num_devs = 0;
        self.tag_error = false;
        self.did_first = false;
        self.did_return = false;
        self.return_state = None;
        self.new_entry = true;
    }

    fn diag(&mut self, diag: Diag, flags: RequestFlags) -> Response {
        let n = flags.num_devs() as usize;
        let mut body = Body::None;
        match diag {
            Diag::Ber {
                flags: ber,
                time_ms,
                delta_ms,
            } => {
                self.ber = Ber {
                    flags: ber,
                    time: time_ms,
                    delta: delta_ms,
                };
                if ber.running() && self.state == State::Idle {
                    log::info!("BER run started at {time_ms} ms, step {delta_ms} ms");
                    self.begin(flags, 0);
                    self.return_state = Some(State::Ber);
                    self.state = State::Wakeup { pulses: 0 };
                }
            }
            Diag::Read => {
                body = Body::Diag {
                    cycle_count: self.cycle_count,
                    counts: (0..n).map(|dev| self.shadow.pec(dev).into()).collect(),
                };
            }
            Diag::Clear(select) => {
                if select.cycle_count() {
                    self.cycle_count = 0;
                }
                for dev in 0..n {
                    let pec = self.shadow.pec_mut(dev);
                    if select.host_crc() {
                        pec.host = 0;
                    }
                    if select.device() {
                        pec.device = 0;
                    }
                }
            }
        }
        Response {
            status: Status::Success,
            flags: ResponseFlags::default()
                .with_dir(flags.dir())
                .with_num_devs(flags.num_devs()),
            body,
        }
    }

    /// Abandon the current transaction.
    ///
    /// Returns the `Timeout` response for it, or `None` if idle.
    pub fn abort(&mut self) -> Option<Response> {
        if self.state == State::Idle {
            return None;
        }
        log::warn!("Aborting in {:?}", self.state);
        self.link.cancel();
        self.ber.flags = self.ber.flags.with_running(false);
        self.return_state = None;
        self.did_first = false;
        self.did_return = false;
        self.outcome = Ok(());
        self.body = Body::None;
        self.state = State::Idle;
        self.new_entry = true;
        Some(Response {
            status: Status::Timeout,
            flags: self.response_flags(),
            body: Body::None,
        })
    }

    fn entered(&mut self) -> bool {
        let state = discriminant(&self.state);
        let entered = self.prev != Some(state);
        self.prev = Some(state);
        entered
    }

    /// Advance the state machine.
    ///
    /// Returns the response once a started request completes.
    pub fn task<P: Pack>(&mut self, pack: &mut P) -> Option<Response> {
        let now = self.link.now();
        if !(self.poll_timer.expired(now) || self.new_entry || self.link.waiting()) {
            return None;
        }
        self.new_entry = false;

        let mut response = None;
        let mut running = true;
        while running {
            let entered = self.entered();
            running = match self.state {
                State::Idle => {
                    let now = self.link.now();
                    self.poll_timer
                        .start(now, self.settings.poll_period_ms.millis());
                    false
                }
                State::Wakeup { pulses } => self.wakeup(pulses),
                State::Passthrough => self.passthrough(),
                State::RegRead => {
                    let access = Access {
                        tag: self.flags.use_tag().then_some(self.tag),
                        break_detect: self.flags.need_loopback(),
                        collect: true,
                        ..Default::default()
                    };
                    let result = self.read(self.addr, access);
                    self.finish(result)
                }
                State::RegWrite => {
                    let access = Access {
                        break_detect: self.flags.need_loopback(),
                        ack: self.flags.need_response(),
                        ..Default::default()
                    };
                    let result = self.write(self.addr, access);
                    self.finish(result)
                }
                State::DevPoll(phase) => self.dev_poll(entered, phase, pack),
                State::Ber => self.ber(),
                State::CommandComplete => {
                    response = self.complete();
                    true
                }
                State::Error => {
                    if entered {
                        let now = self.link.now();
                        self.poll_timer
                            .start(now, self.settings.error_backoff_ms.millis());
                        false
                    } else {
                        self.state = State::Idle;
                        true
                    }
                }
            };
        }
        response
    }

    fn transfer(&mut self) -> Poll<Result<(), Error>> {
        let (tx, rx) = self.frame.buffers();
        self.link.transfer(
            self.dir,
            tx,
            rx,
            self.flags.num_devs(),
            self.active_balance,
            self.flags.synchronous(),
        )
    }

    /// Keep the first non-fatal error of a transaction.
    fn record(&mut self, result: Result<(), Error>) {
        if self.outcome.is_ok() {
            self.outcome = result;
        }
    }

    /// Abort the transaction with a fatal error.
    fn fail(&mut self, e: Error) -> bool {
        log::warn!("{:?} failed: {e}", self.state);
        self.outcome = Err(e);
        self.link.cancel();
        self.did_first = false;
        self.dir = self.flags.dir();
        if self.return_state != Some(State::Ber) {
            self.return_state = None;
        }
        self.state = State::CommandComplete;
        true
    }

    fn finish(&mut self, result: Poll<Result<(), Error>>) -> bool {
        match result {
            Poll::Pending => false,
            Poll::Ready(Err(e)) => self.fail(e),
            Poll::Ready(Ok(())) => {
                self.state = State::CommandComplete;
                true
            }
        }
    }

    fn wakeup(&mut self, pulses: u8) -> bool {
        if pulses <= self.flags.num_devs() {
            if let Err(e) = self.link.pulse(self.dir, Opcode::Snap) {
                return self.fail(e);
            }
            let now = self.link.now();
            self.poll_timer.start(now, T_LADDER);
            self.state = State::Wakeup { pulses: pulses + 1 };
            false
        } else if self.flags.need_loopback() && !self.did_first {
            self.did_first = true;
            self.dir = !self.dir;
            log::debug!("Waking from {:?}", self.dir);
            self.state = State::Wakeup { pulses: 0 };
            true
        } else {
            self.did_first = false;
            self.dir = self.flags.dir();
            self.state = self.return_state.take().unwrap_or(State::CommandComplete);
            true
        }
    }

    fn passthrough(&mut self) -> bool {
        match self.transfer() {
            Poll::Pending => false,
            Poll::Ready(Err(e)) => self.fail(e),
            Poll::Ready(Ok(())) => {
                self.body = Body::Passthrough(Vec::from_slice(self.frame.rx()).unwrap_or_default());
                self.rx_num_devs = self.flags.num_devs();
                self.state = State::CommandComplete;
                true
            }
        }
    }

    fn resolve_breaks(&mut self, num_devs: usize) -> Option<Outcome> {
        let (outcome, sum) = self.breaks.classify(num_devs)?;
        let idx = self.breaks[Direction::A].break_idx;
        log::info!(
            "Chain break {outcome:?}: {idx} devices from A, {} from B",
            self.breaks[Direction::B].break_idx
        );
        self.rx_num_devs = sum;
        self.report.record(outcome, idx);
        Some(outcome)
    }

    /// Read register `addr` from all devices.
    ///
    /// With break detection a read with PEC errors is retried once from the other end.
    fn read(&mut self, addr: u8, access: Access) -> Poll<Result<(), Error>> {
        let n = self.flags.num_devs() as usize;
        if !self.link.waiting() {
            let desc = readable(addr)?;
            if n == 0 {
                return Poll::Ready(Err(Error::BadParameter));
            }
            if access.break_detect {
                if !self.did_first {
                    self.shadow.clear(desc, n);
                    self.report = BreakReport::default();
                    self.breaks[!self.dir].prepare();
                }
                self.breaks[self.dir].prepare();
            }
            self.frame.build_read(addr, desc, access.tag, n);
        }
        ready!(self.transfer())?;

        let dir = self.dir;
        self.rx_num_devs = self.frame.parse_read(
            dir != self.head,
            dir,
            self.did_first,
            &mut self.shadow,
            &mut self.breaks[dir],
            &mut self.inject,
        );
        if access.break_detect && self.breaks[dir].crc_error && !self.did_first {
            log::warn!("PEC errors reading {addr:#04x} from {dir:?}, retrying from {:?}", !dir);
            self.did_first = true;
            self.dir = !dir;
            self.new_entry = true;
            return Poll::Pending;
        }
        if access.break_detect {
            self.resolve_breaks(n);
        }
        self.breaks[dir].commit();
        if core::mem::take(&mut self.did_first) {
            self.dir = !dir;
        }

        let desc = *self.frame.descriptor();
        if access.tag.is_some() {
            self.tag_error |= (0..n).any(|dev| self.shadow.flags(dev, &desc).tag_fail());
        }
        if access.collect {
            self.collect(&desc, n);
        }
        Poll::Ready(Ok(()))
    }

    /// Write register `addr` or send a broadcast to all devices.
    ///
    /// With ACK checking a missing acknowledge is retried once from the other end if break
    /// detection is on. A single clean break then counts as success.
    fn write(&mut self, addr: u8, access: Access) -> Poll<Result<(), Error>> {
        let n = self.flags.num_devs() as usize;
        if !self.link.waiting() {
            let desc = writable(addr)?;
            if n == 0 {
                return Poll::Ready(Err(Error::BadParameter));
            }
            if access.break_detect && access.ack && desc.ack {
                if !self.did_first {
                    self.report = BreakReport::default();
                    self.breaks[!self.dir].prepare();
                }
                self.breaks[self.dir].prepare();
            }
            let dir = self.dir;
            self.frame.build_write(
                addr,
                desc,
                n,
                dir == self.head,
                dir,
                &self.data,
                &mut self.shadow,
                &mut self.inject,
            )?;
        }
        ready!(self.transfer())?;

        self.rx_num_devs = n as u8;
        if !(access.ack && self.frame.descriptor().ack) {
            return Poll::Ready(Ok(()));
        }
        let dir = self.dir;
        let check = self.frame.check_ack(
            dir != self.head,
            self.did_first,
            &mut self.shadow,
            &mut self.breaks[dir],
        );
        self.rx_num_devs = check.acked;
        if check.failed && access.break_detect && !self.did_first {
            log::warn!("Missing ACKs for {addr:#04x} from {dir:?}, retrying from {:?}", !dir);
            self.did_first = true;
            self.dir = !dir;
            self.new_entry = true;
            return Poll::Pending;
        }

        let mut result = if check.failed {
            log::warn!("{} of {n} devices acknowledged {addr:#04x}", check.acked);
            Err(Error::AckFailed)
        } else {
            Ok(())
        };
        if access.break_detect && self.resolve_breaks(n) == Some(Outcome::Single) {
            result = Ok(());
        }
        if core::mem::take(&mut self.did_first) {
            self.dir = !dir;
        }
        Poll::Ready(result)
    }

    /// Return the register contents of all devices in wire order.
    fn collect(&mut self, desc: &Descriptor, n: usize) {
        let reversed = self.dir != self.head;
        let regs = (0..n)
            .map(|slot| {
                let dev = if reversed { n - 1 - slot } else { slot };
                Readback {
                    flags: self.shadow.flags(dev, desc),
                    words: Vec::from_slice(self.shadow.words(dev, desc)).unwrap_or_default(),
                }
            })
            .collect();
        self.body = Body::Registers(regs);
    }

    fn update_pack<P: Pack>(&mut self, pack: &mut P) -> Result<(), Error> {
        let n = self.flags.num_devs() as usize;
        let readings = Readings {
            shadow: &self.shadow,
            settings: &self.settings,
            therm: self.therm,
            report: self.report,
            num_devs: n,
        };
        pack.update(&readings, &mut self.write_cfg[..n]).map_err(|e| {
            log::warn!("Pack update failed: {e:?}");
            Error::PackFailure
        })
    }

    fn load_write_cfg(&mut self) {
        let n = self.flags.num_devs() as usize;
        self.data.clear();
        for cfg in &self.write_cfg[..n] {
            self.data.extend_from_slice(&cfg.words()).ok();
        }
    }

    /// Move to the next phase once the current transfer has finished.
    fn advance(&mut self, result: Poll<Result<(), Error>>, next: Phase) -> bool {
        match result {
            Poll::Pending => false,
            Poll::Ready(Err(e)) if !sticky(e) => self.fail(e),
            Poll::Ready(result) => {
                self.record(result);
                self.state = State::DevPoll(next);
                self.new_entry = true;
                false
            }
        }
    }

    fn dev_poll<P: Pack>(&mut self, entered: bool, phase: Phase, pack: &mut P) -> bool {
        let phase = if entered {
            self.cycle_count = self.cycle_count.wrapping_add(1);
            self.did_first = false;
            log::debug!("Poll cycle {}", self.cycle_count);
            Phase::Mute { second: false }
        } else {
            phase
        };
        let poll = Access {
            tag: self.flags.use_tag().then_some(self.tag),
            break_detect: self.flags.need_loopback(),
            ..Default::default()
        };
        let plain = Access::default();

        let (result, next) = match phase {
            Phase::Mute { .. } if !self.active_balance => (Poll::Ready(Ok(())), Phase::Aux(0)),
            Phase::Mute { second } => {
                self.dir = if second {
                    !self.flags.dir()
                } else {
                    self.flags.dir()
                };
                let result = self.write(Opcode::Mute.into(), plain);
                if result.is_ready() {
                    self.dir = self.flags.dir();
                }
                let next = if second {
                    Phase::Aux(0)
                } else {
                    Phase::Mute { second: true }
                };
                (result, next)
            }
            Phase::Aux(i) => {
                let result = self.read(AUX[i].into(), poll);
                let next = if i + 1 < AUX.len() {
                    Phase::Aux(i + 1)
                } else if self.active_balance {
                    Phase::PrimeN
                } else {
                    Phase::Config
                };
                (result, next)
            }
            Phase::PrimeN => (self.write(Opcode::PrimeN.into(), plain), Phase::Config),
            Phase::Config => (self.read(Opcode::RdCfg.into(), poll), Phase::Snap),
            Phase::Snap => {
                let access = Access {
                    ack: self.flags.need_response(),
                    ..plain
                };
                (self.write(Opcode::Snap.into(), access), Phase::Snapshot(0))
            }
            Phase::Snapshot(i) => {
                let result = self.read(SNAPSHOT[i].into(), poll);
                let next = if i + 1 < SNAPSHOT.len() {
                    Phase::Snapshot(i + 1)
                } else if self.active_balance {
                    Phase::Unmute
                } else {
                    Phase::ModuleId
                };
                (result, next)
            }
            Phase::Unmute => (self.write(Opcode::Unmute.into(), plain), Phase::ModuleId),
            Phase::ModuleId => {
                let access = Access { tag: None, ..poll };
                (self.read(Opcode::RdFs3.into(), access), Phase::Pack)
            }
            Phase::Pack => (Poll::Ready(self.update_pack(pack)), Phase::WriteCfg),
            Phase::WriteCfg => {
                if !self.link.waiting() {
                    self.load_write_cfg();
                }
                let access = Access {
                    break_detect: self.flags.need_loopback(),
                    ack: self.flags.use_ack(),
                    ..plain
                };
                let result = self.write(Opcode::WrCfg.into(), access);
                return match result {
                    Poll::Pending => false,
                    Poll::Ready(Err(e)) if !sticky(e) => self.fail(e),
                    Poll::Ready(result) => {
                        self.record(result);
                        self.state = State::CommandComplete;
                        self.new_entry = true;
                        false
                    }
                };
            }
        };
        self.advance(result, next)
    }

    fn ber(&mut self) -> bool {
        if !self.ber.flags.running() {
            log::info!("BER run stopped after {} cycles", self.cycle_count);
            self.state = State::Idle;
            return true;
        }
        if !self.did_return {
            self.outcome = Ok(());
            self.return_state = Some(State::Ber);
            self.state = if self.link.asleep(self.flags.dir()) {
                State::Wakeup { pulses: 0 }
            } else {
                State::DevPoll(Phase::Mute { second: false })
            };
            true
        } else {
            self.did_return = false;
            let interval = self
                .ber
                .step(self.settings.ber_min_ms, self.settings.ber_max_ms);
            log::debug!("Next BER cycle in {interval} ms");
            let now = self.link.now();
            self.poll_timer.start(now, (interval as u32).millis());
            false
        }
    }

    fn response_flags(&self) -> ResponseFlags {
        ResponseFlags::default()
            .with_num_devs(self.rx_num_devs)
            .with_dir(self.flags.dir())
            .with_got_loopback(self.flags.need_loopback())
            .with_got_response(self.flags.need_response())
            .with_synchronous(self.flags.synchronous())
            .with_tag_fail(self.tag_error)
    }

    fn complete(&mut self) -> Option<Response> {
        if let Some(state) = self.return_state.take() {
            self.state = state;
            self.did_return = true;
            return None;
        }
        self.did_return = false;
        let result = core::mem::replace(&mut self.outcome, Ok(()));
        if let Err(e) = result {
            log::warn!("Transaction failed: {e}");
        }
        self.state = if result == Err(Error::Driver) {
            State::Error
        } else {
            State::Idle
        };
        Some(Response {
            status: result.into(),
            flags: self.response_flags(),
            body: core::mem::take(&mut self.body),
        })
    }
}
