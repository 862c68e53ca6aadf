/// ReefNet Sensus Ultra parser.
///
/// The recorder is a pure depth gauge: it keeps no wall clock, only a
/// relative device timestamp, and its samples are absolute pressure plus
/// temperature. Depth is reconstructed against the surface pressure
/// captured in the dive header.
use crate::datetime::DateTime;
use crate::error::{Error, Result};
use crate::parser::{DiveMode, FamilyParser, FieldKind, FieldValue};
use crate::sample::Sample;

const HEADER_SIZE: usize = 16;
const SAMPLE_SIZE: usize = 4;

/* Sea water at 1025 kg/m3; the recorder does not know the salinity. */
const DENSITY: f64 = 1025.0;
const GRAVITY: f64 = 9.80665;

/* Metres of sea water per millibar above surface pressure. */
const METER_PER_MBAR: f64 = 100.0 / (DENSITY * GRAVITY);

#[derive(Debug, Clone, Copy)]
struct Summary {
    maxdepth: f64,
    temperature_min: Option<f64>,
}

pub(crate) struct ReefnetParser<'a> {
    data: &'a [u8],
    summary: Option<Summary>,
}

impl<'a> ReefnetParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::DataFormat("dive shorter than its header"));
        }
        Ok(Self {
            data,
            summary: None,
        })
    }

    fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn interval(&self) -> u32 {
        self.le16(8) as u32
    }

    fn surface_mbar(&self) -> f64 {
        self.le16(10) as f64
    }

    fn depth_from_mbar(&self, pressure: f64) -> f64 {
        ((pressure - self.surface_mbar()) * METER_PER_MBAR).max(0.0)
    }

    fn summary(&mut self) -> Summary {
        if let Some(summary) = self.summary {
            return summary;
        }

        let mut maxdepth = 0.0f64;
        let mut temperature_min: Option<f64> = None;
        for sample in self.data[HEADER_SIZE..].chunks_exact(SAMPLE_SIZE) {
            let pressure = u16::from_le_bytes([sample[0], sample[1]]) as f64;
            let temperature = u16::from_le_bytes([sample[2], sample[3]]) as f64 / 10.0;

            maxdepth = maxdepth.max(self.depth_from_mbar(pressure));
            temperature_min = Some(match temperature_min {
                Some(t) => t.min(temperature),
                None => temperature,
            });
        }

        let summary = Summary {
            maxdepth,
            temperature_min,
        };
        self.summary = Some(summary);
        summary
    }
}

impl<'a> FamilyParser<'a> for ReefnetParser<'a> {
    /* The hardware clock is relative to power-up; the host correlates it  */
    /* through the Clock event instead.                                    */
    fn datetime(&mut self) -> Result<DateTime> {
        Err(Error::Unsupported)
    }

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        match kind {
            FieldKind::DiveTime => {
                let nsamples = self.le16(2) as u32;
                Ok(FieldValue::Time(nsamples * self.interval()))
            }
            FieldKind::MaxDepth => Ok(FieldValue::Depth(self.summary().maxdepth)),
            FieldKind::Atmospheric => Ok(FieldValue::Pressure(self.surface_mbar() / 1000.0)),
            FieldKind::TemperatureMin => match self.summary().temperature_min {
                Some(t) => Ok(FieldValue::Temperature(t)),
                None => Err(Error::Unsupported),
            },
            FieldKind::DiveMode => Ok(FieldValue::Mode(DiveMode::Gauge)),
            FieldKind::GasMixCount | FieldKind::TankCount => Ok(FieldValue::Count(0)),
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let interval_ms = self.interval() * 1000;
        let mut time = 0u32;

        for sample in self.data[HEADER_SIZE..].chunks_exact(SAMPLE_SIZE) {
            let pressure = u16::from_le_bytes([sample[0], sample[1]]) as f64;
            let temperature = u16::from_le_bytes([sample[2], sample[3]]) as f64 / 10.0;

            time += interval_ms;
            callback(Sample::Time(time));
            callback(Sample::Depth(self.depth_from_mbar(pressure)));
            callback(Sample::Temperature(temperature));
        }
        Ok(())
    }
}
