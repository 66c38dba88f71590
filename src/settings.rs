//! Runtime settings of the chain driver.
//!
//! The settings form a [miniconf::Tree] so that the host can read and update single entries by
//! path. The chain head is only taken at [crate::Chain::init].
use miniconf::Tree;
use serde::{Deserialize, Serialize};

use crate::transport::Direction;

#[derive(Clone, Debug, Tree, Serialize, Deserialize, PartialEq)]
#[tree(meta(doc, typename))]
pub struct Settings {
    /// End of the chain wired to device 0.
    #[tree(with=miniconf::leaf)]
    pub chain_head: Direction,

    /// Re-check period while idle, in milliseconds.
    pub poll_period_ms: u32,

    /// Back-off after a transport failure, in milliseconds.
    pub error_backoff_ms: u32,

    /// Shortest bit error rate poll interval, in milliseconds.
    pub ber_min_ms: u16,

    /// Longest bit error rate poll interval, in milliseconds.
    pub ber_max_ms: u16,

    /// Output resolution of cell and auxiliary voltages in µV per bit.
    pub brick_uv_b: u32,

    /// Output resolution of the stack voltage in µV per bit.
    pub stack_uv_b: u32,

    /// Subtracted from thermistor temperatures, in 0.1 °C.
    pub therm_offset: i16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chain_head: Direction::A,
            poll_period_ms: 100,
            error_backoff_ms: 500,
            ber_min_ms: 5,
            ber_max_ms: 20,
            brick_uv_b: 100,
            stack_uv_b: 1000,
            therm_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_by_path() {
        let mut s = Settings::default();
        miniconf::json_core::set(&mut s, "/ber_max_ms", b"30").unwrap();
        miniconf::json_core::set(&mut s, "/chain_head", b"\"B\"").unwrap();
        miniconf::json_core::set(&mut s, "/therm_offset", b"-5").unwrap();
        assert_eq!(s.ber_max_ms, 30);
        assert_eq!(s.chain_head, Direction::B);
        assert_eq!(s.therm_offset, -5);
        assert!(miniconf::json_core::set(&mut s, "/missing", b"1").is_err());
    }
}
