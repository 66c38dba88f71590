//! isoSPI link to the two ends of the chain.
//!
//! # Design
//! The chain is wired to one SPI bus through an isoSPI transceiver pair. A single select line
//! steers the bus to the A end or the B end. [IsoSpi] is the seam to the hardware: it selects
//! the end, writes short wake pulses and runs full duplex frame transfers that may complete
//! later. [Link] adds the device timing on top of it: the idle wake sequence before a frame,
//! the direction change settling time and the idle and sleep timers of each end.
use core::ops::Not;
use core::task::Poll;

use bitbybit::bitenum;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use embedded_hal_bus::spi::DeviceError;
use fugit::{MicrosDurationU32, MillisDurationU32};
use serde::{Deserialize, Serialize};

use crate::frame::FRAME_LEN;
use crate::Error;
use ltc831::{pec, Opcode};

/// Millisecond time base of the link timers.
pub type Instant = fugit::TimerInstantU32<1000>;

/// A device drops to IDLE after this long without traffic.
pub const T_IDLE: MillisDurationU32 = MillisDurationU32::millis(3);
/// A device drops to SLEEP after this long without a valid command.
pub const T_SLEEP: MillisDurationU32 = MillisDurationU32::millis(1700);
/// Settling time after the select line changes the end.
pub const T_DIR: MicrosDurationU32 = MicrosDurationU32::micros(50);
/// Ready time after each idle wake pulse.
pub const T_READY: MicrosDurationU32 = MicrosDurationU32::micros(10);
/// Spacing of the SNAP pulses of the sleep wake ladder.
pub const T_LADDER: MillisDurationU32 = MillisDurationU32::millis(2);

/// End of the chain a frame is sent from.
#[bitenum(u1, exhaustive = true)]
#[derive(Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    A = 0,
    B = 1,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

impl Not for Direction {
    type Output = Self;

    fn not(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Monotonic millisecond clock.
pub trait Clock {
    fn now(&mut self) -> Instant;
}

/// One-shot timer.
///
/// Once expired, a timer stays expired until restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timer {
    #[default]
    Stopped,
    Running(Instant),
    Expired,
}

impl Timer {
    pub fn start(&mut self, now: Instant, period: MillisDurationU32) {
        *self = Self::Running(now + period);
    }

    pub fn stop(&mut self) {
        *self = Self::Stopped;
    }

    /// Force the timer into the expired state.
    pub fn expire(&mut self) {
        *self = Self::Expired;
    }

    pub fn expired(&mut self, now: Instant) -> bool {
        if let Self::Running(deadline) = *self {
            if now >= deadline {
                *self = Self::Expired;
            }
        }
        *self == Self::Expired
    }
}

/// isoSPI transceiver interface.
pub trait IsoSpi {
    type Error: core::fmt::Debug;

    /// Steer the bus to one end of the chain.
    fn select(&mut self, dir: Direction) -> Result<(), Self::Error>;

    /// Transmit a short frame and wait until it is on the wire.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Start a full duplex transfer of `tx`.
    fn start(&mut self, tx: &[u8]) -> Result<(), Self::Error>;

    /// Poll the transfer started last. On completion the received bytes are in `rx`.
    fn poll(&mut self, rx: &mut [u8]) -> Poll<Result<(), Self::Error>>;
}

/// [IsoSpi] over a blocking SPI bus and a select pin (low: A end, high: B end).
///
/// Transfers complete within [IsoSpi::start].
pub struct Blocking<B, P> {
    bus: B,
    sel: P,
    buf: [u8; FRAME_LEN],
    len: usize,
}

impl<B: SpiBus<u8>, P: OutputPin> Blocking<B, P> {
    pub fn new(bus: B, sel: P) -> Self {
        Self {
            bus,
            sel,
            buf: [0; FRAME_LEN],
            len: 0,
        }
    }

    pub fn release(self) -> (B, P) {
        (self.bus, self.sel)
    }
}

impl<B: SpiBus<u8>, P: OutputPin> IsoSpi for Blocking<B, P> {
    type Error = DeviceError<B::Error, P::Error>;

    fn select(&mut self, dir: Direction) -> Result<(), Self::Error> {
        match dir {
            Direction::A => self.sel.set_low(),
            Direction::B => self.sel.set_high(),
        }
        .map_err(DeviceError::Cs)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(data).map_err(DeviceError::Spi)?;
        self.bus.flush().map_err(DeviceError::Spi)
    }

    fn start(&mut self, tx: &[u8]) -> Result<(), Self::Error> {
        self.len = tx.len().min(FRAME_LEN);
        let buf = &mut self.buf[..self.len];
        buf.copy_from_slice(&tx[..self.len]);
        self.bus.transfer_in_place(buf).map_err(DeviceError::Spi)?;
        self.bus.flush().map_err(DeviceError::Spi)
    }

    fn poll(&mut self, rx: &mut [u8]) -> Poll<Result<(), Self::Error>> {
        let len = self.len.min(rx.len());
        rx[..len].copy_from_slice(&self.buf[..len]);
        Poll::Ready(Ok(()))
    }
}

fn driver<E: core::fmt::Debug>(e: E) -> Error {
    log::warn!("isoSPI transport failure: {e:?}");
    Error::Driver
}

/// Timed access to both ends of the chain.
pub struct Link<S, D, C> {
    spi: S,
    delay: D,
    clock: C,
    idle: [Timer; 2],
    sleep: [Timer; 2],
    prev_dir: Direction,
    dir_change: bool,
    waiting: bool,
    len: usize,
}

impl<S: IsoSpi, D: DelayNs, C: Clock> Link<S, D, C> {
    pub fn new(spi: S, delay: D, clock: C) -> Self {
        Self {
            spi,
            delay,
            clock,
            idle: [Timer::Expired; 2],
            sleep: [Timer::Expired; 2],
            prev_dir: Direction::A,
            dir_change: false,
            waiting: false,
            len: 0,
        }
    }

    /// Forget all device timing: both ends are considered asleep.
    pub fn reset(&mut self) {
        self.idle = [Timer::Expired; 2];
        self.sleep = [Timer::Expired; 2];
        self.prev_dir = Direction::A;
        self.dir_change = false;
        self.waiting = false;
    }

    pub fn release(self) -> (S, D, C) {
        (self.spi, self.delay, self.clock)
    }

    pub fn now(&mut self) -> Instant {
        self.clock.now()
    }

    /// A transfer has been started and not yet completed.
    pub fn waiting(&self) -> bool {
        self.waiting
    }

    /// Drop a pending transfer.
    pub fn cancel(&mut self) {
        self.waiting = false;
    }

    /// The devices seen from `dir` may have dropped to SLEEP.
    pub fn asleep(&mut self, dir: Direction) -> bool {
        let now = self.clock.now();
        self.sleep[dir.index()].expired(now)
    }

    pub fn idle_timer(&self, dir: Direction) -> Timer {
        self.idle[dir.index()]
    }

    pub fn sleep_timer(&self, dir: Direction) -> Timer {
        self.sleep[dir.index()]
    }

    /// Send one pulse of the sleep wake ladder from `dir`.
    ///
    /// A valid command keeps the woken devices out of SLEEP, so the sleep timer of that end
    /// restarts.
    pub fn pulse(&mut self, dir: Direction, op: Opcode) -> Result<(), Error> {
        if dir != self.prev_dir {
            self.dir_change = true;
            self.prev_dir = dir;
        }
        let code = u8::from(op);
        self.spi.select(dir).map_err(driver)?;
        self.spi.write(&[code, pec::command(&[code])]).map_err(driver)?;
        self.delay.delay_us(T_DIR.ticks());
        let now = self.clock.now();
        self.sleep[dir.index()].start(now, T_SLEEP);
        Ok(())
    }

    /// Bring the devices seen from `dir` from IDLE to READY.
    ///
    /// Sends `num_devs + 1` MUTE (active balancing) or UNMUTE pulses after a direction
    /// change or once the idle timer of that end has expired.
    fn wake_idle(
        &mut self,
        dir: Direction,
        num_devs: u8,
        active_balance: bool,
    ) -> Result<(), Error> {
        if dir != self.prev_dir {
            self.dir_change = true;
            self.prev_dir = dir;
        }
        let now = self.clock.now();
        if !(self.dir_change || self.idle[dir.index()].expired(now)) {
            return Ok(());
        }

        let op = if active_balance {
            Opcode::Mute
        } else {
            Opcode::Unmute
        };
        log::debug!("Idle wake from {dir:?} with {op:?}");
        let code = u8::from(op);
        let pulse = [code, pec::command(&[code])];

        self.delay.delay_ms(T_IDLE.ticks());
        for _ in 0..=num_devs {
            self.spi.select(dir).map_err(driver)?;
            self.spi.write(&pulse).map_err(driver)?;
            if self.dir_change {
                self.delay.delay_us(T_DIR.ticks());
                self.dir_change = false;
            }
            self.delay.delay_us(T_READY.ticks());
        }
        let now = self.clock.now();
        self.idle[dir.index()].start(now, T_IDLE);
        Ok(())
    }

    /// Transfer a frame from `dir`.
    ///
    /// The first call wakes the devices and starts the transfer. In synchronous mode it spins
    /// until completion, otherwise it returns [Poll::Pending] and later calls poll the
    /// transport. Completion restarts the idle and sleep timers of that end.
    pub fn transfer(
        &mut self,
        dir: Direction,
        tx: &[u8],
        rx: &mut [u8],
        num_devs: u8,
        active_balance: bool,
        synchronous: bool,
    ) -> Poll<Result<(), Error>> {
        if !self.waiting {
            self.wake_idle(dir, num_devs, active_balance)?;
            self.spi.select(dir).map_err(driver)?;
            if self.dir_change {
                self.delay.delay_us(T_DIR.ticks());
                self.dir_change = false;
            }
            self.len = tx.len().min(rx.len());
            self.spi.start(&tx[..self.len]).map_err(driver)?;
            self.waiting = true;
            if !synchronous {
                return Poll::Pending;
            }
        }

        loop {
            match self.spi.poll(&mut rx[..self.len]) {
                Poll::Pending if synchronous => continue,
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    self.waiting = false;
                    result.map_err(driver)?;
                    let now = self.clock.now();
                    self.idle[dir.index()].start(now, T_IDLE);
                    self.sleep[dir.index()].start(now, T_SLEEP);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
