/// Cressi Leonardo family parser.
///
/// The dive blob is the 32-byte logbook header followed by 16-bit sample
/// words whose low two bits select the channel (scuba depth, freedive
/// depth, temperature, surface interval) and whose upper fourteen bits
/// carry the value. Freedive sessions instead append zero-terminated
/// sub-sequences of (depth, duration) pairs spliced in from the scratch
/// region.
use crate::datetime::DateTime;
use crate::device::cressi::{HEADER_SIZE, MODE_FREEDIVE, SAMPLE_SIZE};
use crate::error::{Error, Result};
use crate::parser::{
    DecoModel, DiveMode, FamilyParser, FieldKind, FieldValue, GasMix, Salinity,
};
use crate::sample::Sample;

/* Sample word channel tags. */
const TAG_DEPTH: u16 = 0;
const TAG_DEPTH_FREE: u16 = 1;
const TAG_TEMPERATURE: u16 = 2;
const TAG_SURFACE: u16 = 3;

pub(crate) struct CressiParser<'a> {
    data: &'a [u8],
}

impl<'a> CressiParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::DataFormat("dive shorter than its header"));
        }
        Ok(Self { data })
    }

    fn mode_byte(&self) -> u8 {
        self.data[0]
    }

    fn mode(&self) -> DiveMode {
        match self.mode_byte() {
            2 => DiveMode::Gauge,
            MODE_FREEDIVE => DiveMode::Freedive,
            _ => DiveMode::OpenCircuit,
        }
    }

    fn interval(&self) -> u32 {
        u16::from_le_bytes([self.data[20], self.data[21]]) as u32
    }

    fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn scuba_samples(&self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let interval_ms = self.interval() * 1000;
        let mut time = 0u32;

        for word in self.data[HEADER_SIZE..].chunks_exact(SAMPLE_SIZE) {
            let word = u16::from_le_bytes([word[0], word[1]]);
            let value = (word >> 2) as u32;

            match word & 0x03 {
                TAG_DEPTH | TAG_DEPTH_FREE => {
                    time += interval_ms;
                    callback(Sample::Time(time));
                    callback(Sample::Depth(value as f64 / 100.0));
                }
                TAG_TEMPERATURE => {
                    /* Attached to the current tick; no time advance. */
                    callback(Sample::Temperature(value as f64 / 10.0));
                }
                TAG_SURFACE => {
                    /* One zero-depth tick, then the clock jumps over the  */
                    /* rest of the surface interval.                       */
                    time += interval_ms;
                    callback(Sample::Time(time));
                    callback(Sample::Depth(0.0));
                    time += (value * 1000).saturating_sub(interval_ms);
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    /* Freedive sessions: zero-terminated sub-sequences of (depth in       */
    /* decimetres, duration in seconds) byte pairs, one per plunge.        */
    fn freedive_samples(&self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let mut time = 0u32;

        for plunge in self.data[HEADER_SIZE..].split(|&b| b == 0) {
            for pair in plunge.chunks_exact(2) {
                time += pair[1] as u32 * 1000;
                callback(Sample::Time(time));
                callback(Sample::Depth(pair[0] as f64 / 10.0));
            }
        }
        Ok(())
    }
}

impl<'a> FamilyParser<'a> for CressiParser<'a> {
    fn datetime(&mut self) -> Result<DateTime> {
        Ok(DateTime::new(
            2000 + self.data[2] as u16,
            self.data[3],
            self.data[4],
            self.data[5],
            self.data[6],
            self.data[7],
        ))
    }

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        match kind {
            FieldKind::DiveTime => Ok(FieldValue::Time(self.le16(10) as u32)),
            FieldKind::MaxDepth => Ok(FieldValue::Depth(self.le16(12) as f64 / 100.0)),
            FieldKind::AvgDepth => Ok(FieldValue::Depth(self.le16(14) as f64 / 100.0)),
            FieldKind::Atmospheric => Ok(FieldValue::Pressure(self.le16(16) as f64 / 1000.0)),
            FieldKind::TemperatureMin => {
                Ok(FieldValue::Temperature(self.le16(18) as f64 / 10.0))
            }
            FieldKind::Salinity => Ok(FieldValue::Salinity(match self.data[22] {
                0 => Salinity::FRESH,
                _ => Salinity::SALT,
            })),
            FieldKind::DiveMode => Ok(FieldValue::Mode(self.mode())),
            FieldKind::DecoModel => match self.mode() {
                DiveMode::OpenCircuit => Ok(FieldValue::Model(DecoModel::Rgbm)),
                _ => Err(Error::Unsupported),
            },
            FieldKind::GasMixCount => Ok(FieldValue::Count(match self.mode() {
                DiveMode::OpenCircuit => 1,
                _ => 0,
            })),
            FieldKind::GasMix(index) => {
                if self.mode() != DiveMode::OpenCircuit || index > 0 {
                    return Err(Error::InvalidArgs("gas mix index out of range"));
                }
                Ok(FieldValue::Mix(GasMix::from_percent(self.data[1], 0)))
            }
            FieldKind::TankCount => Ok(FieldValue::Count(0)),
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        if self.mode_byte() == MODE_FREEDIVE {
            self.freedive_samples(callback)
        } else {
            self.scuba_samples(callback)
        }
    }
}
