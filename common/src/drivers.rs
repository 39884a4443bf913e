//! Wire formats of the I²C sensors on the environmental node.

pub const AHT20_ADDR: u8 = 0x38;
pub const AHT20_INIT: [u8; 3] = [0xBE, 0x08, 0x00];
pub const AHT20_TRIGGER: [u8; 3] = [0xAC, 0x33, 0x00];
pub const AHT20_MEASURE_MS: u32 = 80;

pub const BH1750_ADDR: u8 = 0x23;
pub const BH1750_POWER_ON: u8 = 0x01;
pub const BH1750_CONTINUOUS_HIGH_RES: u8 = 0x10;

pub const SGP40_ADDR: u8 = 0x59;
pub const SGP40_MEASURE_MS: u32 = 30;

const AHT20_BUSY: u8 = 0x80;
const TWO_POW_20: f32 = 1_048_576.0;

/// Decodes an AHT20 measurement frame into °C and %RH. `None` while the sensor is busy.
pub fn aht20_decode(frame: &[u8; 6]) -> Option<(f32, f32)> {
    if frame[0] & AHT20_BUSY != 0 {
        return None;
    }

    let humidity_raw =
        (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let temperature_raw =
        (u32::from(frame[3] & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);

    let humidity = humidity_raw as f32 / TWO_POW_20 * 100.0;
    let temperature_c = temperature_raw as f32 / TWO_POW_20 * 200.0 - 50.0;
    Some((temperature_c, humidity))
}

pub fn bh1750_lux(raw: [u8; 2]) -> f32 {
    f32::from(u16::from_be_bytes(raw)) / 1.2
}

/// Sensirion CRC-8: polynomial 0x31, init 0xFF.
pub fn sensirion_crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFF_u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// `measure_raw` command with humidity/temperature compensation words.
pub fn sgp40_measure_command(temperature_c: f32, humidity: f32) -> [u8; 8] {
    let rh_ticks = ticks(humidity.clamp(0.0, 100.0) / 100.0);
    let t_ticks = ticks((temperature_c.clamp(-45.0, 130.0) + 45.0) / 175.0);
    let rh = rh_ticks.to_be_bytes();
    let t = t_ticks.to_be_bytes();
    [
        0x26,
        0x0F,
        rh[0],
        rh[1],
        sensirion_crc8(&rh),
        t[0],
        t[1],
        sensirion_crc8(&t),
    ]
}

fn ticks(fraction: f32) -> u16 {
    (fraction * 65_535.0).round() as u16
}

/// Raw VOC ticks from a measurement reply; `None` on a CRC mismatch.
pub fn sgp40_decode(reply: &[u8; 3]) -> Option<u16> {
    if sensirion_crc8(&reply[..2]) != reply[2] {
        return None;
    }
    Some(u16::from_be_bytes([reply[0], reply[1]]))
}

const VOC_INDEX_MEAN: f32 = 100.0;
const VOC_INDEX_MAX: f32 = 500.0;
const VOC_TICKS_PER_MEAN: f32 = 400.0;
const VOC_LEARNING_SAMPLES: u32 = 45;
const VOC_BASELINE_ALPHA: f32 = 1.0 / 720.0;

/// Maps raw VOC ticks onto a 1..=500 index around a slowly adapting baseline.
/// 100 is the typical air of the last hours; lower raw ticks mean more VOCs.
#[derive(Debug, Clone, Default)]
pub struct VocIndexEstimator {
    baseline: Option<f32>,
    samples: u32,
}

impl VocIndexEstimator {
    pub fn process(&mut self, raw: u16) -> u16 {
        let raw = f32::from(raw);
        let baseline = *self.baseline.get_or_insert(raw);

        let index =
            (VOC_INDEX_MEAN * (1.0 + (baseline - raw) / VOC_TICKS_PER_MEAN)).clamp(1.0, VOC_INDEX_MAX);

        let alpha = if self.samples < VOC_LEARNING_SAMPLES {
            1.0 / (self.samples as f32 + 2.0)
        } else {
            VOC_BASELINE_ALPHA
        };
        self.baseline = Some(baseline + alpha * (raw - baseline));
        self.samples = self.samples.saturating_add(1);

        index.round() as u16
    }
}
