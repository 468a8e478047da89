//! ADS1115 16-bit ADC over I2C, used to read the battery divider tap.
//!
//! Single-ended, PGA ±4.096 V, 128 SPS, single-shot mode.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

use irrigation_core::battery::BatterySensor;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       write 1 to start a single-shot conversion
//   [14:12] MUX      input multiplexer
//   [11:9]  PGA      programmable gain amplifier
//   [8]     MODE     0 = continuous, 1 = single-shot
//   [7:5]   DR       data rate
//   [1:0]   COMP_QUE 11 = comparator off

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// AINx vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: u8 = 3;

/// Full-scale voltage for PGA=001.
const FULL_SCALE_V: f32 = 4.096;

/// 128 SPS is ~7.8 ms per conversion.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel)] << MUX_SHIFT)
}

/// Convert a conversion result to volts at the ADC pin. Single-ended reads
/// are never negative; bus noise below zero reads as 0 V.
fn raw_to_volts(raw: i16) -> f32 {
    f32::from(raw.max(0)) * FULL_SCALE_V / 32_768.0
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115 {
    i2c: I2c,
    channel: u8,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: u8) -> anyhow::Result<Self> {
        anyhow::ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0-{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(addr = format_args!("0x{addr:02x}"), channel, "ads1115 initialised");
        Ok(Self { i2c, channel })
    }

    fn read_raw(&mut self) -> anyhow::Result<i16> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(self.channel).to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl BatterySensor for Ads1115 {
    fn read_pin_volts(&mut self) -> anyhow::Result<f32> {
        self.read_raw().map(raw_to_volts)
    }
}
