/// Suunto Vyper family parser.
///
/// A dive chunk is the 13-byte header followed by a delta-encoded depth
/// profile: plain bytes are signed depth deltas in decimetres per tick,
/// and a few reserved byte values escape temperature readings, gas
/// switches, bookmarks and the end of the profile. The header's year is a
/// single digit; the decade comes from the host clock.
use crate::datetime::{DateTime, resolve_decade};
use crate::device::suunto::HEADER_SIZE;
use crate::error::{Error, Result};
use crate::parser::{DecoModel, DiveMode, FamilyParser, FieldKind, FieldValue, GasMix};
use crate::sample::{EventFlags, Sample, normalize_event};

/* Reserved profile byte values. Depth deltas stay within -125..=124. */
const MARKER_TEMPERATURE: u8 = 0x7D;
const MARKER_GASSWITCH: u8 = 0x7E;
const MARKER_BOOKMARK: u8 = 0x7F;
const MARKER_END_OF_PROFILE: u8 = 0x82;

pub(crate) struct SuuntoParser<'a> {
    data: &'a [u8],
    host_year: u16,
    /* Oxygen percentages discovered in the profile, mix 0 first. */
    gasmixes: Option<Vec<u8>>,
}

impl<'a> SuuntoParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::DataFormat("dive shorter than its header"));
        }
        Ok(Self {
            data,
            host_year: DateTime::now().year,
            gasmixes: None,
        })
    }

    fn profile(&self) -> &'a [u8] {
        let body = &self.data[HEADER_SIZE..];
        match body.iter().position(|&b| b == MARKER_END_OF_PROFILE) {
            Some(end) => &body[..end],
            None => body,
        }
    }

    /* Single profile pass filling the gas-mix cache. */
    fn mixes(&mut self) -> &[u8] {
        if self.gasmixes.is_none() {
            let mut mixes = Vec::new();
            if self.data[6] > 0 {
                mixes.push(self.data[6]);
            }

            let profile = self.profile();
            let mut iter = profile.iter();
            while let Some(&byte) = iter.next() {
                match byte {
                    MARKER_GASSWITCH => {
                        if let Some(&o2) = iter.next() {
                            if !mixes.contains(&o2) {
                                mixes.push(o2);
                            }
                        }
                    }
                    MARKER_TEMPERATURE => {
                        iter.next();
                    }
                    _ => {}
                }
            }
            self.gasmixes = Some(mixes);
        }
        self.gasmixes.as_deref().unwrap_or_default()
    }
}

impl<'a> FamilyParser<'a> for SuuntoParser<'a> {
    fn datetime(&mut self) -> Result<DateTime> {
        let year = resolve_decade(2000 + self.data[0] as u16, self.host_year);
        Ok(DateTime::new(
            year,
            self.data[1],
            self.data[2],
            self.data[3],
            self.data[4],
            0,
        ))
    }

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        match kind {
            FieldKind::DiveTime => Ok(FieldValue::Time(
                u16::from_be_bytes([self.data[9], self.data[10]]) as u32,
            )),
            FieldKind::MaxDepth => Ok(FieldValue::Depth(
                u16::from_be_bytes([self.data[7], self.data[8]]) as f64 / 100.0,
            )),
            FieldKind::TemperatureMin => {
                Ok(FieldValue::Temperature(self.data[11] as i8 as f64))
            }
            FieldKind::DiveMode => Ok(FieldValue::Mode(if self.data[6] == 0 {
                DiveMode::Gauge
            } else {
                DiveMode::OpenCircuit
            })),
            FieldKind::DecoModel => Ok(FieldValue::Model(DecoModel::Rgbm)),
            FieldKind::GasMixCount => Ok(FieldValue::Count(self.mixes().len() as u32)),
            FieldKind::GasMix(index) => {
                let mixes = self.mixes();
                match mixes.get(index) {
                    Some(&o2) => Ok(FieldValue::Mix(GasMix::from_percent(o2, 0))),
                    None => Err(Error::InvalidArgs("gas mix index out of range")),
                }
            }
            FieldKind::TankCount => Ok(FieldValue::Count(0)),
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        /* Resolve the mix table first so gas switches can be reported as  */
        /* indices into it.                                                */
        let mixes = self.mixes().to_vec();
        let interval_ms = self.data[5] as u32 * 1000;

        let mut time = 0u32;
        let mut depth_dm = 0i32;

        let profile = self.profile();
        let mut iter = profile.iter();
        while let Some(&byte) = iter.next() {
            match byte {
                MARKER_TEMPERATURE => {
                    if let Some(&raw) = iter.next() {
                        callback(Sample::Temperature(raw as i8 as f64));
                    }
                }
                MARKER_GASSWITCH => {
                    if let Some(&o2) = iter.next() {
                        if let Some(index) = mixes.iter().position(|&m| m == o2) {
                            callback(Sample::GasMix(index));
                        }
                    }
                }
                MARKER_BOOKMARK => {
                    if let Some(kind) = normalize_event("Bookmark") {
                        callback(Sample::Event {
                            kind,
                            flags: EventFlags::NONE,
                            value: 0,
                        });
                    }
                }
                _ => {
                    depth_dm = (depth_dm + byte as i8 as i32).max(0);
                    time += interval_ms;
                    callback(Sample::Time(time));
                    callback(Sample::Depth(depth_dm as f64 / 10.0));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::EventKind;

    fn dive(profile: &[u8]) -> Vec<u8> {
        let mut d = vec![4, 6, 15, 10, 30, 20, 21, 0x01, 0x2C, 0x00, 0x78, 12, 0];
        d.extend_from_slice(profile);
        d.push(MARKER_END_OF_PROFILE);
        d
    }

    #[test]
    fn datetime_recovers_decade_from_host_clock() {
        let data = dive(&[]);
        let mut parser = SuuntoParser::new(&data).unwrap();
        parser.host_year = 2026;
        assert_eq!(
            parser.datetime().unwrap(),
            DateTime::new(2024, 6, 15, 10, 30, 0)
        );

        /* Digit ahead of the host's: previous decade. */
        parser.host_year = 2023;
        assert_eq!(parser.datetime().unwrap().year, 2014);
    }

    #[test]
    fn summary_fields() {
        let data = dive(&[]);
        let mut parser = SuuntoParser::new(&data).unwrap();

        assert_eq!(
            parser.field(FieldKind::MaxDepth).unwrap(),
            FieldValue::Depth(3.0)
        );
        assert_eq!(
            parser.field(FieldKind::DiveTime).unwrap(),
            FieldValue::Time(120)
        );
        assert_eq!(
            parser.field(FieldKind::TemperatureMin).unwrap(),
            FieldValue::Temperature(12.0)
        );
        assert_eq!(
            parser.field(FieldKind::DiveMode).unwrap(),
            FieldValue::Mode(DiveMode::OpenCircuit)
        );
    }

    #[test]
    fn delta_profile_accumulates() {
        /* +2.1 m, +1.0 m, -0.5 m over a 20 second interval. */
        let data = dive(&[21, 10, 0xFB]);
        let mut parser = SuuntoParser::new(&data).unwrap();

        let mut samples = Vec::new();
        parser
            .samples_foreach(&mut |s| samples.push(format!("{s:?}")))
            .unwrap();

        assert_eq!(
            samples,
            vec![
                format!("{:?}", Sample::Time(20000)),
                format!("{:?}", Sample::Depth(2.1)),
                format!("{:?}", Sample::Time(40000)),
                format!("{:?}", Sample::Depth(3.1)),
                format!("{:?}", Sample::Time(60000)),
                format!("{:?}", Sample::Depth(2.6)),
            ]
        );
    }

    #[test]
    fn markers_between_ticks() {
        let data = dive(&[30, MARKER_TEMPERATURE, 11, MARKER_GASSWITCH, 32, MARKER_BOOKMARK, 5]);
        let mut parser = SuuntoParser::new(&data).unwrap();

        assert_eq!(
            parser.field(FieldKind::GasMixCount).unwrap(),
            FieldValue::Count(2)
        );

        let mut samples = Vec::new();
        parser
            .samples_foreach(&mut |s| samples.push(format!("{s:?}")))
            .unwrap();

        assert_eq!(
            samples,
            vec![
                format!("{:?}", Sample::Time(20000)),
                format!("{:?}", Sample::Depth(3.0)),
                format!("{:?}", Sample::Temperature(11.0)),
                format!("{:?}", Sample::GasMix(1)),
                format!(
                    "{:?}",
                    Sample::Event {
                        kind: EventKind::Bookmark,
                        flags: EventFlags::NONE,
                        value: 0
                    }
                ),
                format!("{:?}", Sample::Time(40000)),
                format!("{:?}", Sample::Depth(3.5)),
            ]
        );
    }

    #[test]
    fn depth_never_goes_negative() {
        let data = dive(&[5, 0x80u8.wrapping_add(0x10)]); /* -112 dm */
        let mut parser = SuuntoParser::new(&data).unwrap();

        let mut depths = Vec::new();
        parser
            .samples_foreach(&mut |s| {
                if let Sample::Depth(d) = s {
                    depths.push(d);
                }
            })
            .unwrap();
        assert_eq!(depths, vec![0.5, 0.0]);
    }
}
