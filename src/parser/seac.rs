/// Seac Screen family parser.
///
/// Dives are self-contained: a 32-byte header with the firmware number,
/// start time, summary fields and gas table, then fixed-interval 4-byte
/// samples of depth plus an auxiliary channel (temperature or gas switch).
/// The firmware number maps onto a data-layout generation; numbers outside
/// the known ranges mean the dive cannot be decoded.
use crate::datetime::DateTime;
use crate::error::{Error, Result};
use crate::parser::{
    DecoModel, DiveMode, FamilyParser, FieldKind, FieldValue, GasMix,
};
use crate::sample::Sample;

const HEADER_SIZE: usize = 32;
const SAMPLE_SIZE: usize = 4;

/* Auxiliary channel encodings. */
const AUX_NONE: u16 = 0xFFFF;
const AUX_GASSWITCH_TAG: u16 = 0xF000;

const MAX_GASMIXES: usize = 3;

/* Data-layout generation recovered from the firmware number. */
fn version_from_firmware(firmware: u16) -> Result<u8> {
    match firmware {
        161..=165 => Ok(0),
        166..=169 => Ok(1),
        170..=179 => Ok(2),
        100..=110 => Ok(3),
        200..=205 => Ok(4),
        300.. => Ok(5),
        _ => Err(Error::DataFormat("firmware outside known ranges")),
    }
}

pub(crate) struct SeacParser<'a> {
    data: &'a [u8],
    version: u8,
}

impl<'a> SeacParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::DataFormat("dive shorter than its header"));
        }
        let firmware = u16::from_le_bytes([data[0], data[1]]);
        let version = version_from_firmware(firmware)?;
        Ok(Self { data, version })
    }

    fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn ngasmixes(&self) -> usize {
        (self.data[17] as usize).min(MAX_GASMIXES)
    }
}

impl<'a> FamilyParser<'a> for SeacParser<'a> {
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
            FieldKind::DiveTime => Ok(FieldValue::Time(self.le16(8) as u32)),
            FieldKind::MaxDepth => Ok(FieldValue::Depth(self.le16(10) as f64 / 100.0)),
            FieldKind::AvgDepth => {
                /* The running average only appears in the second          */
                /* generation of the layout.                               */
                if self.version < 2 {
                    return Err(Error::Unsupported);
                }
                Ok(FieldValue::Depth(self.le16(12) as f64 / 100.0))
            }
            FieldKind::Atmospheric => Ok(FieldValue::Pressure(self.le16(14) as f64 / 1000.0)),
            FieldKind::DiveMode => Ok(FieldValue::Mode(match self.data[16] {
                2 => DiveMode::Gauge,
                _ => DiveMode::OpenCircuit,
            })),
            FieldKind::DecoModel => Ok(FieldValue::Model(DecoModel::Buhlmann)),
            FieldKind::GasMixCount => Ok(FieldValue::Count(self.ngasmixes() as u32)),
            FieldKind::GasMix(index) => {
                if index >= self.ngasmixes() {
                    return Err(Error::InvalidArgs("gas mix index out of range"));
                }
                Ok(FieldValue::Mix(GasMix::from_percent(
                    self.data[18 + 2 * index],
                    self.data[19 + 2 * index],
                )))
            }
            FieldKind::TankCount => Ok(FieldValue::Count(0)),
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let interval_ms = self.le16(24) as u32 * 1000;
        let mut time = 0u32;

        for sample in self.data[HEADER_SIZE..].chunks_exact(SAMPLE_SIZE) {
            let depth = u16::from_le_bytes([sample[0], sample[1]]);
            let aux = u16::from_le_bytes([sample[2], sample[3]]);

            time += interval_ms;
            callback(Sample::Time(time));
            callback(Sample::Depth(depth as f64 / 100.0));

            match aux {
                AUX_NONE => {}
                aux if aux & AUX_GASSWITCH_TAG == AUX_GASSWITCH_TAG => {
                    let index = (aux & 0x00FF) as usize;
                    if index < self.ngasmixes() {
                        callback(Sample::GasMix(index));
                    }
                }
                temperature => {
                    callback(Sample::Temperature(temperature as f64 / 10.0));
                }
            }
        }
        Ok(())
    }
}
