//! Conversion of raw device codes to engineering units.

/// A type representing a cell, auxiliary or reference voltage code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CellCode(pub u16);

impl CellCode {
    /// Resolution of the device code.
    pub const UV_PER_LSB: u32 = 80;

    /// Rescale to `uv_per_bit` microvolts per output bit.
    pub fn scale(self, uv_per_bit: u32) -> u16 {
        let v = Self::UV_PER_LSB * self.0 as u32 / uv_per_bit.max(1);
        v.min(u16::MAX as u32) as u16
    }
}

impl From<u16> for CellCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// A type representing a stack voltage code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StackCode(pub u16);

impl StackCode {
    pub const UV_PER_LSB: u32 = 1280;

    /// Rescale to `uv_per_bit` microvolts per output bit.
    pub fn scale(self, uv_per_bit: u32) -> u32 {
        Self::UV_PER_LSB * self.0 as u32 / uv_per_bit.max(1)
    }
}

impl From<u16> for StackCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// A type representing the die temperature diode code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DieTempCode(pub u16);

impl DieTempCode {
    // Gain in 0.1 K per 1000 LSB, offset 273.2 K.
    const GAIN: u32 = 2178;
    const OFFSET: i32 = 2732;
}

impl From<u16> for DieTempCode {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<DieTempCode> for i16 {
    /// Die temperature in 0.1 °C.
    fn from(code: DieTempCode) -> i16 {
        let t = (DieTempCode::GAIN * code.0 as u32 / 1000) as i32 - DieTempCode::OFFSET;
        t.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

/// Monotone lookup table with linear interpolation between points.
///
/// Points are `(x, y)` sorted by ascending `x`. Inputs outside the table clamp to the first or
/// last `y`.
#[derive(Copy, Clone, Debug)]
pub struct XyTable<'a> {
    points: &'a [(u16, i16)],
}

impl<'a> XyTable<'a> {
    pub const fn new(points: &'a [(u16, i16)]) -> Self {
        Self { points }
    }

    pub fn lookup(&self, x: u16) -> i16 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return 0;
        };
        if x <= first.0 {
            return first.1;
        }
        if x >= last.0 {
            return last.1;
        }
        let i = self.points.partition_point(|p| p.0 <= x);
        let (x0, y0) = self.points[i - 1];
        let (x1, y1) = self.points[i];
        let dx = (x - x0) as i32;
        let span = (x1 - x0) as i32;
        (y0 as i32 + (y1 as i32 - y0 as i32) * dx / span) as i16
    }
}

/// 10 kΩ NTC (B = 3435 K) against a 10 kΩ pull-up from the 5 V reference.
///
/// Thermistor input code (80 µV per LSB) to temperature in 0.1 °C.
pub const NTC_10K: XyTable<'static> = XyTable::new(&[
    (3279, 1250),
    (4502, 1100),
    (6287, 950),
    (8909, 800),
    (12736, 650),
    (18177, 500),
    (25475, 350),
    (34311, 200),
    (43501, 50),
    (51397, -100),
    (56915, -250),
    (60080, -400),
]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_scaling() {
        assert_eq!(CellCode(1000).scale(100), 800);
        assert_eq!(CellCode(50_000).scale(100), 40_000);
        assert_eq!(CellCode(u16::MAX).scale(1), u16::MAX);
        assert_eq!(CellCode(10).scale(0), 800);
    }

    #[test]
    fn stack_scaling() {
        assert_eq!(StackCode(1000).scale(1000), 1280);
        assert_eq!(StackCode(u16::MAX).scale(1), 1280 * u16::MAX as u32);
    }

    #[test]
    fn die_temperature() {
        // 25 °C
        assert_eq!(i16::from(DieTempCode(1369)), 249);
        assert_eq!(i16::from(DieTempCode(0)), -2732);
    }

    #[test]
    fn interpolation() {
        let t = XyTable::new(&[(100, 50), (200, -50), (400, -100)]);
        assert_eq!(t.lookup(0), 50);
        assert_eq!(t.lookup(100), 50);
        assert_eq!(t.lookup(150), 0);
        assert_eq!(t.lookup(200), -50);
        assert_eq!(t.lookup(300), -75);
        assert_eq!(t.lookup(u16::MAX), -100);
        assert_eq!(XyTable::new(&[]).lookup(7), 0);
    }

    #[test]
    fn ntc_table_is_monotone() {
        assert!(NTC_10K.points.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 > w[1].1));
        assert_eq!(NTC_10K.lookup(34311), 200);
        let t = NTC_10K.lookup(30000);
        assert!((200..350).contains(&t));
    }
}
