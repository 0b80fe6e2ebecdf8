//! IEEE 802.11 OFDM timing calculations.
//!
//! Contains helpers for:
//! - Interframe spaces and slot time of the 5 GHz OFDM PHY
//! - PPDU airtime of a data frame from payload size and MCS index
//! - ACK airtime at the control rate matching the data rate
//!
//! Units: every duration is an integer number of microseconds.

use super::types::Micros;

/// Backoff slot time.
pub const T_SLOT: Micros = 9;
/// Short interframe space.
pub const T_SIFS: Micros = 16;
/// DCF interframe space: SIFS plus two slots.
pub const T_DIFS: Micros = T_SIFS + 2 * T_SLOT;
/// Wait after a failed attempt before contending again.
pub const ACK_TIMEOUT: Micros = 45;

const T_PREAMBLE: Micros = 16;
const T_SIGNAL: Micros = 4;
const T_SYMBOL: Micros = 4;
const SERVICE_BITS: u64 = 16;
const TAIL_BITS: u64 = 6;
/// MAC header, LLC/SNAP and FCS added to every MSDU.
const MAC_OVERHEAD_BYTES: u64 = 40;
const ACK_BYTES: u64 = 14;

/// OFDM data rates in Mb/s, indexed by MCS.
const DATA_RATES: [u64; 8] = [6, 9, 12, 18, 24, 36, 48, 54];
/// Mandatory basic rates used for control responses.
const BASIC_RATES: [u64; 3] = [6, 12, 24];

/// Durations of one WiFi frame exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// PPDU airtime of the data frame.
    pub data: Micros,
    /// SIFS followed by the ACK PPDU.
    pub ack: Micros,
}

impl FrameTiming {
    /// Computes the exchange timing for `payload_size` bytes at `mcs`. Indices above 7 are treated
    /// as 7.
    pub fn new(payload_size: u32, mcs: u8) -> Self {
        let rate = data_rate(mcs);
        let data = ppdu_duration(payload_size as u64 + MAC_OVERHEAD_BYTES, rate);
        let ack = T_SIFS + ppdu_duration(ACK_BYTES, control_rate(rate));
        Self { data, ack }
    }
}

/// Data rate in Mb/s for an MCS index.
pub fn data_rate(mcs: u8) -> u64 {
    DATA_RATES[(mcs as usize).min(DATA_RATES.len() - 1)]
}

/// Highest basic rate not above the data rate.
fn control_rate(data_rate: u64) -> u64 {
    BASIC_RATES.iter().copied().filter(|r| *r <= data_rate).max().unwrap_or(BASIC_RATES[0])
}

/// Airtime of a PPDU carrying `bytes` of PSDU at `rate` Mb/s.
fn ppdu_duration(bytes: u64, rate: u64) -> Micros {
    let bits_per_symbol = rate * T_SYMBOL;
    let bits = SERVICE_BITS + 8 * bytes + TAIL_BITS;
    let symbols = bits.div_ceil(bits_per_symbol);
    T_PREAMBLE + T_SIGNAL + symbols * T_SYMBOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interframe_spaces() {
        assert_eq!(T_DIFS, 34);
        assert!(ACK_TIMEOUT > T_SIFS);
    }

    #[test]
    fn default_frame_at_54_mbps() {
        let timing = FrameTiming::new(1472, 7);
        // 12118 bits over 216-bit symbols: 57 symbols.
        assert_eq!(timing.data, 20 + 57 * 4);
        // ACK at 24 Mb/s: 134 bits over 96-bit symbols: 2 symbols.
        assert_eq!(timing.ack, 16 + 20 + 2 * 4);
    }

    #[test]
    fn airtime_decreases_with_mcs() {
        let durations: Vec<Micros> = (0..8).map(|mcs| FrameTiming::new(1472, mcs).data).collect();
        assert!(durations.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn airtime_increases_with_payload() {
        assert!(FrameTiming::new(100, 3).data < FrameTiming::new(1500, 3).data);
    }

    #[test]
    fn out_of_range_mcs_saturates() {
        assert_eq!(FrameTiming::new(500, 42), FrameTiming::new(500, 7));
    }

    #[test]
    fn control_rate_never_exceeds_data_rate() {
        assert_eq!(control_rate(9), 6);
        assert_eq!(control_rate(18), 12);
        assert_eq!(control_rate(54), 24);
    }
}
