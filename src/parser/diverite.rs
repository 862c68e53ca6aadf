/// Dive Rite NiTek Q parser.
///
/// The dive blob prepends the device identification and the 32-byte
/// logbook entry to the profile. The profile opens with a 16-byte page
/// carrying the start timestamp, the initial tank pressure and a
/// temperature seed; after that come 8-byte half-pages, either tank-switch
/// records (tag 0xAA) or samples with depth, pressure delta and
/// temperature delta bit-packed into one little-endian word.
use tracing::debug;

use crate::datetime::DateTime;
use crate::device::{diverite::LOGBOOK_ENTRY_SIZE, split_blob};
use crate::error::{Error, Result};
use crate::parser::{
    ATM_TO_PSI, CUFT_TO_LITER, DiveMode, FamilyParser, FieldKind, FieldValue, GasMix,
    PSI_TO_BAR, Salinity, Tank, TankUnits, guess_tank_units,
};
use crate::sample::Sample;

const FIRST_PAGE_SIZE: usize = 16;
const HALF_PAGE_SIZE: usize = 8;

const TAG_TANK_SWITCH: u8 = 0xAA;
const TAG_SAMPLE: u8 = 0x55;

const MAX_TANKS: usize = 3;

/* Bit layout of a sample word: depth in cm, then the signed pressure     */
/* delta in centibar, then the signed temperature delta in 0.1 degC.      */
const DEPTH_BITS: u32 = 14;
const PRESSURE_BITS: u32 = 7;
const TEMPERATURE_BITS: u32 = 6;

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

#[derive(Debug, Clone, Copy, Default)]
struct Summary {
    begin: [Option<f64>; MAX_TANKS],
    end: [Option<f64>; MAX_TANKS],
}

pub(crate) struct NitekQParser<'a> {
    logbook: &'a [u8],
    profile: &'a [u8],
    summary: Option<Summary>,
}

impl<'a> NitekQParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        let (_id, logbook, profile) = split_blob(data)?;
        if logbook.len() != LOGBOOK_ENTRY_SIZE {
            return Err(Error::DataFormat("unexpected logbook entry size"));
        }
        if profile.len() < FIRST_PAGE_SIZE {
            return Err(Error::DataFormat("profile shorter than its first page"));
        }
        Ok(Self {
            logbook,
            profile,
            summary: None,
        })
    }

    fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.logbook[offset], self.logbook[offset + 1]])
    }

    fn ngasmixes(&self) -> usize {
        (self.logbook[18] as usize).min(MAX_TANKS)
    }

    /* Walk the half-pages once, forwarding decoded samples when a        */
    /* callback is interested and collecting per-tank pressures.          */
    fn walk(&self, mut emit: Option<&mut dyn FnMut(Sample<'_>)>) -> Summary {
        let initial = u16::from_le_bytes([self.profile[6], self.profile[7]]) as i32;
        let interval_ms = self.profile[9] as u32 * 1000;

        let mut summary = Summary::default();
        let mut tank = 0usize;
        let mut pressure = initial;
        let mut temperature = self.profile[8] as i8 as f64;
        let mut time = 0u32;

        summary.begin[0] = Some(initial as f64 / 100.0);
        summary.end[0] = Some(initial as f64 / 100.0);

        for page in self.profile[FIRST_PAGE_SIZE..].chunks_exact(HALF_PAGE_SIZE) {
            match page[0] {
                TAG_TANK_SWITCH => {
                    tank = (page[1] as usize).min(MAX_TANKS - 1);
                    pressure = u16::from_le_bytes([page[2], page[3]]) as i32;

                    let bar = pressure as f64 / 100.0;
                    if summary.begin[tank].is_none() {
                        summary.begin[tank] = Some(bar);
                    }
                    summary.end[tank] = Some(bar);

                    if let Some(cb) = emit.as_deref_mut() {
                        cb(Sample::GasMix(tank));
                        cb(Sample::Pressure { tank, bar });
                    }
                }
                TAG_SAMPLE => {
                    let word = u32::from_le_bytes([page[1], page[2], page[3], page[4]]);
                    let depth_cm = word & ((1 << DEPTH_BITS) - 1);
                    let dpressure = sign_extend(
                        (word >> DEPTH_BITS) & ((1 << PRESSURE_BITS) - 1),
                        PRESSURE_BITS,
                    );
                    let dtemperature = sign_extend(
                        (word >> (DEPTH_BITS + PRESSURE_BITS)) & ((1 << TEMPERATURE_BITS) - 1),
                        TEMPERATURE_BITS,
                    );

                    pressure -= dpressure;
                    temperature += dtemperature as f64 / 10.0;
                    time += interval_ms;

                    let bar = pressure as f64 / 100.0;
                    summary.end[tank] = Some(bar);

                    if let Some(cb) = emit.as_deref_mut() {
                        cb(Sample::Time(time));
                        cb(Sample::Depth(depth_cm as f64 / 100.0));
                        cb(Sample::Temperature(temperature));
                        cb(Sample::Pressure { tank, bar });
                    }
                }
                other => {
                    debug!("skipping unknown half-page record {other:#04x}");
                }
            }
        }
        summary
    }

    fn summary(&mut self) -> Summary {
        if let Some(summary) = self.summary {
            return summary;
        }
        let summary = self.walk(None);
        self.summary = Some(summary);
        summary
    }
}

impl<'a> FamilyParser<'a> for NitekQParser<'a> {
    fn datetime(&mut self) -> Result<DateTime> {
        Ok(DateTime::new(
            2000 + self.logbook[0] as u16,
            self.logbook[1],
            self.logbook[2],
            self.logbook[3],
            self.logbook[4],
            self.logbook[5],
        ))
    }

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        match kind {
            FieldKind::DiveTime => Ok(FieldValue::Time(self.le16(6) as u32)),
            FieldKind::MaxDepth => Ok(FieldValue::Depth(self.le16(8) as f64 / 100.0)),
            FieldKind::Atmospheric => Ok(FieldValue::Pressure(self.le16(12) as f64 / 1000.0)),
            FieldKind::Salinity => Ok(FieldValue::Salinity(match self.logbook[11] {
                0 => Salinity::FRESH,
                _ => Salinity::SALT,
            })),
            FieldKind::DiveMode => Ok(FieldValue::Mode(match self.logbook[10] {
                2 => DiveMode::Gauge,
                _ => DiveMode::OpenCircuit,
            })),
            FieldKind::GasMixCount => Ok(FieldValue::Count(self.ngasmixes() as u32)),
            FieldKind::GasMix(index) => {
                if index >= self.ngasmixes() {
                    return Err(Error::InvalidArgs("gas mix index out of range"));
                }
                Ok(FieldValue::Mix(GasMix::from_percent(
                    self.logbook[19 + 2 * index],
                    self.logbook[20 + 2 * index],
                )))
            }
            FieldKind::TankCount => Ok(FieldValue::Count(self.ngasmixes() as u32)),
            FieldKind::Tank(index) => {
                if index >= self.ngasmixes() {
                    return Err(Error::InvalidArgs("tank index out of range"));
                }

                let raw_volume = self.le16(25) as f64 / 100.0;
                let raw_workpressure = self.le16(27) as f64;
                let units = guess_tank_units(raw_volume, raw_workpressure);

                let (volume, workpressure) = match units {
                    TankUnits::Metric => (raw_volume, raw_workpressure),
                    TankUnits::Imperial => (
                        /* Cubic feet of gas at the working pressure,      */
                        /* converted to the tank's water capacity.         */
                        raw_volume * CUFT_TO_LITER / (raw_workpressure / ATM_TO_PSI),
                        raw_workpressure * PSI_TO_BAR,
                    ),
                };

                let summary = self.summary();
                Ok(FieldValue::Tank(Tank {
                    gasmix: Some(index),
                    volume,
                    workpressure,
                    beginpressure: summary.begin[index].unwrap_or(0.0),
                    endpressure: summary.end[index].unwrap_or(0.0),
                    units,
                }))
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.walk(Some(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::assemble_blob;

    fn logbook(volume_raw: u16, workpressure_raw: u16) -> [u8; LOGBOOK_ENTRY_SIZE] {
        let mut entry = [0u8; LOGBOOK_ENTRY_SIZE];
        entry[..6].copy_from_slice(&[24, 6, 15, 10, 30, 0]);
        entry[6..8].copy_from_slice(&1800u16.to_le_bytes());
        entry[8..10].copy_from_slice(&2500u16.to_le_bytes());
        entry[10] = 0;
        entry[11] = 1;
        entry[12..14].copy_from_slice(&1013u16.to_le_bytes());
        entry[18] = 2;
        entry[19..23].copy_from_slice(&[21, 0, 50, 0]);
        entry[25..27].copy_from_slice(&volume_raw.to_le_bytes());
        entry[27..29].copy_from_slice(&workpressure_raw.to_le_bytes());
        entry
    }

    fn first_page(pressure_cbar: u16, temperature: i8, interval: u8) -> [u8; FIRST_PAGE_SIZE] {
        let mut page = [0u8; FIRST_PAGE_SIZE];
        page[..6].copy_from_slice(&[24, 6, 15, 10, 30, 0]);
        page[6..8].copy_from_slice(&pressure_cbar.to_le_bytes());
        page[8] = temperature as u8;
        page[9] = interval;
        page
    }

    fn sample_page(depth_cm: u16, dpressure: i8, dtemperature: i8) -> [u8; HALF_PAGE_SIZE] {
        let word = (depth_cm as u32 & ((1 << DEPTH_BITS) - 1))
            | (((dpressure as u32) & ((1 << PRESSURE_BITS) - 1)) << DEPTH_BITS)
            | (((dtemperature as u32) & ((1 << TEMPERATURE_BITS) - 1))
                << (DEPTH_BITS + PRESSURE_BITS));

        let mut page = [0u8; HALF_PAGE_SIZE];
        page[0] = TAG_SAMPLE;
        page[1..5].copy_from_slice(&word.to_le_bytes());
        page
    }

    fn tank_switch(tank: u8, pressure_cbar: u16) -> [u8; HALF_PAGE_SIZE] {
        let mut page = [0u8; HALF_PAGE_SIZE];
        page[0] = TAG_TANK_SWITCH;
        page[1] = tank;
        page[2..4].copy_from_slice(&pressure_cbar.to_le_bytes());
        page
    }

    fn blob(logbook: &[u8], profile: &[u8]) -> Vec<u8> {
        assemble_blob(&[0u8; 4], logbook, profile)
    }

    #[test]
    fn bit_packed_samples_decode() {
        let mut profile = first_page(20_000, 21, 10).to_vec();
        profile.extend_from_slice(&sample_page(350, 5, -2));
        profile.extend_from_slice(&sample_page(720, 8, 1));
        let data = blob(&logbook(1200, 232), &profile);

        let mut parser = NitekQParser::new(&data).unwrap();
        let mut times = Vec::new();
        let mut depths = Vec::new();
        let mut temperatures = Vec::new();
        let mut pressures = Vec::new();
        parser
            .samples_foreach(&mut |s| match s {
                Sample::Time(t) => times.push(t),
                Sample::Depth(d) => depths.push(d),
                Sample::Temperature(t) => temperatures.push(t),
                Sample::Pressure { bar, .. } => pressures.push(bar),
                _ => {}
            })
            .unwrap();

        assert_eq!(times, vec![10000, 20000]);
        assert_eq!(depths, vec![3.5, 7.2]);
        assert!((temperatures[0] - 20.8).abs() < 1e-9);
        assert!((temperatures[1] - 20.9).abs() < 1e-9);
        assert_eq!(pressures, vec![199.95, 199.87]);
    }

    #[test]
    fn tank_switch_changes_pressure_source() {
        let mut profile = first_page(20_000, 20, 10).to_vec();
        profile.extend_from_slice(&sample_page(300, 2, 0));
        profile.extend_from_slice(&tank_switch(1, 18_000));
        profile.extend_from_slice(&sample_page(310, 3, 0));
        let data = blob(&logbook(1200, 232), &profile);

        let mut parser = NitekQParser::new(&data).unwrap();
        let mut pressures = Vec::new();
        let mut switches = Vec::new();
        parser
            .samples_foreach(&mut |s| match s {
                Sample::Pressure { tank, bar } => pressures.push((tank, bar)),
                Sample::GasMix(index) => switches.push(index),
                _ => {}
            })
            .unwrap();

        assert_eq!(switches, vec![1]);
        assert_eq!(pressures[0], (0, 199.98));
        assert_eq!(pressures[1], (1, 180.0));
        assert_eq!(pressures[2], (1, 179.97));
    }

    #[test]
    fn metric_tank_passes_through() {
        let data = blob(&logbook(1200, 232), &first_page(20_000, 20, 10));
        let mut parser = NitekQParser::new(&data).unwrap();

        let FieldValue::Tank(tank) = parser.field(FieldKind::Tank(0)).unwrap() else {
            panic!("expected a tank");
        };
        assert_eq!(tank.units, TankUnits::Metric);
        assert_eq!(tank.volume, 12.0);
        assert_eq!(tank.workpressure, 232.0);
        assert_eq!(tank.beginpressure, 200.0);
    }

    #[test]
    fn fractional_volume_is_imperial() {
        /* 77.4 cuft at 3000 psi. */
        let data = blob(&logbook(7740, 3000), &first_page(20_000, 20, 10));
        let mut parser = NitekQParser::new(&data).unwrap();

        let FieldValue::Tank(tank) = parser.field(FieldKind::Tank(0)).unwrap() else {
            panic!("expected a tank");
        };
        assert_eq!(tank.units, TankUnits::Imperial);
        assert!((tank.workpressure - 3000.0 * PSI_TO_BAR).abs() < 1e-9);
        let expected = 77.4 * CUFT_TO_LITER / (3000.0 / ATM_TO_PSI);
        assert!((tank.volume - expected).abs() < 1e-9);
    }

    #[test]
    fn summary_fields_from_logbook() {
        let data = blob(&logbook(1200, 232), &first_page(20_000, 20, 10));
        let mut parser = NitekQParser::new(&data).unwrap();

        assert_eq!(
            parser.datetime().unwrap(),
            DateTime::new(2024, 6, 15, 10, 30, 0)
        );
        assert_eq!(
            parser.field(FieldKind::DiveTime).unwrap(),
            FieldValue::Time(1800)
        );
        assert_eq!(
            parser.field(FieldKind::GasMixCount).unwrap(),
            FieldValue::Count(2)
        );
        assert_eq!(
            parser.field(FieldKind::GasMix(1)).unwrap(),
            FieldValue::Mix(GasMix::from_percent(50, 0))
        );
        assert!(matches!(
            parser.field(FieldKind::GasMix(2)),
            Err(Error::InvalidArgs(_))
        ));
    }
}
