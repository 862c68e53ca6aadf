/// Divesoft Freedom / Liberty parser.
///
/// The profile is a TLV stream: a little-endian type id selects an entry
/// in a static descriptor table that declares the record's name, payload
/// size and, for group records, the sub-field sizes the payload is
/// tokenized by. Unknown type ids end the walk without error; observed
/// but unmodeled channels (ventilation, absolute pressure) surface as
/// opaque vendor samples instead of being dropped.
use tracing::debug;

use crate::datetime::DateTime;
use crate::device::{divesoft::HEADER_SIZE, split_blob};
use crate::error::{Error, Result};
use crate::parser::{
    DecoModel, DiveMode, FamilyParser, FieldKind, FieldValue, GasMix, Salinity,
};
use crate::sample::{DecoKind, DecoStatus, EventFlags, Sample, normalize_event};

/* One tick of the sample clock. */
const TIME_UNIT_MS: u32 = 50;

/* Nil value for 16-bit channels. */
const NIL16: u16 = 0xFFFF;

const MAX_GASMIXES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    SampleGroup,
    Temperature,
    Pressure,
    GasMix,
    Deco,
    Setpoint,
    Ppo2,
    Cns,
    Bearing,
    Rbt,
    Event,
    Vendor,
}

/* Descriptor cache entry: wire type id, display name, payload size and   */
/* the sub-field layout group records are tokenized by.                   */
struct TypeDescriptor {
    id: u16,
    name: &'static str,
    size: usize,
    kind: RecordKind,
    subtypes: &'static [(&'static str, usize)],
}

static TYPE_TABLE: &[TypeDescriptor] = &[
    TypeDescriptor {
        id: 0x0001,
        name: "+Sample",
        size: 4,
        kind: RecordKind::SampleGroup,
        subtypes: &[("Time", 2), ("Depth", 2)],
    },
    TypeDescriptor {
        id: 0x0002,
        name: "Temperature",
        size: 2,
        kind: RecordKind::Temperature,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0003,
        name: "Pressure",
        size: 3,
        kind: RecordKind::Pressure,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0004,
        name: "GasMix",
        size: 1,
        kind: RecordKind::GasMix,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0005,
        name: "Deco",
        size: 7,
        kind: RecordKind::Deco,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0006,
        name: "Setpoint",
        size: 2,
        kind: RecordKind::Setpoint,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0007,
        name: "PPO2",
        size: 3,
        kind: RecordKind::Ppo2,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0008,
        name: "CNS",
        size: 2,
        kind: RecordKind::Cns,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0009,
        name: "Bearing",
        size: 2,
        kind: RecordKind::Bearing,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x000A,
        name: "RBT",
        size: 2,
        kind: RecordKind::Rbt,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0010,
        name: "Event",
        size: 4,
        kind: RecordKind::Event,
        subtypes: &[],
    },
    /* Observed on the wire but not part of the normalized model; kept    */
    /* as opaque vendor samples.                                          */
    TypeDescriptor {
        id: 0x0020,
        name: "Ventilation",
        size: 2,
        kind: RecordKind::Vendor,
        subtypes: &[],
    },
    TypeDescriptor {
        id: 0x0021,
        name: "AbsPressure",
        size: 2,
        kind: RecordKind::Vendor,
        subtypes: &[],
    },
];

fn descriptor(id: u16) -> Option<&'static TypeDescriptor> {
    TYPE_TABLE.iter().find(|d| d.id == id)
}

/* Device event ids and their textual names; unknown names produce no     */
/* normalized event.                                                      */
static EVENT_STRINGS: &[(u8, &str)] = &[
    (1, "Ascent Rate Exceeded"),
    (2, "Safety Stop Broken"),
    (3, "PO2 High"),
    (4, "PO2 Low"),
    (5, "Bookmark"),
    (6, "Ceiling Broken"),
    (7, "Battery Low"),
];

fn event_name(id: u8) -> Option<&'static str> {
    EVENT_STRINGS
        .iter()
        .find(|(i, _)| *i == id)
        .map(|(_, name)| *name)
}

pub(crate) struct DivesoftParser<'a> {
    header: &'a [u8],
    profile: &'a [u8],
}

impl<'a> DivesoftParser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Result<Self> {
        let (_id, header, profile) = split_blob(data)?;
        if header.len() != HEADER_SIZE {
            return Err(Error::DataFormat("unexpected logbook header size"));
        }
        Ok(Self { header, profile })
    }

    fn le16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.header[offset], self.header[offset + 1]])
    }

    fn ngasmixes(&self) -> usize {
        (self.header[19] as usize).min(MAX_GASMIXES)
    }
}

impl<'a> FamilyParser<'a> for DivesoftParser<'a> {
    fn datetime(&mut self) -> Result<DateTime> {
        Ok(DateTime::new(
            2000 + self.header[4] as u16,
            self.header[5],
            self.header[6],
            self.header[7],
            self.header[8],
            self.header[9],
        ))
    }

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        match kind {
            FieldKind::DiveTime => Ok(FieldValue::Time(self.le16(10) as u32)),
            FieldKind::MaxDepth => Ok(FieldValue::Depth(self.le16(12) as f64 / 100.0)),
            FieldKind::Atmospheric => Ok(FieldValue::Pressure(self.le16(16) as f64 / 1000.0)),
            FieldKind::Salinity => Ok(FieldValue::Salinity(match self.header[18] {
                0 => Salinity::FRESH,
                _ => Salinity::SALT,
            })),
            FieldKind::DiveMode => Ok(FieldValue::Mode(match self.header[14] {
                1 => DiveMode::ClosedCircuit,
                2 => DiveMode::Gauge,
                _ => DiveMode::OpenCircuit,
            })),
            FieldKind::DecoModel => Ok(FieldValue::Model(match self.header[15] {
                1 => DecoModel::Vpm,
                _ => DecoModel::Buhlmann,
            })),
            FieldKind::GasMixCount => Ok(FieldValue::Count(self.ngasmixes() as u32)),
            FieldKind::GasMix(index) => {
                if index >= self.ngasmixes() {
                    return Err(Error::InvalidArgs("gas mix index out of range"));
                }
                Ok(FieldValue::Mix(GasMix::from_percent(
                    self.header[20 + 2 * index],
                    self.header[21 + 2 * index],
                )))
            }
            FieldKind::TankCount => Ok(FieldValue::Count(0)),
            _ => Err(Error::Unsupported),
        }
    }

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        let mut pos = 0;

        while pos + 2 <= self.profile.len() {
            let id = u16::from_le_bytes([self.profile[pos], self.profile[pos + 1]]);
            let Some(desc) = descriptor(id) else {
                /* No descriptor, no length: the rest of the stream is     */
                /* unreadable. Skipped, not an error.                      */
                debug!("unknown sample type {id:#06x}; skipping remainder");
                break;
            };
            pos += 2;

            if pos + desc.size > self.profile.len() {
                debug!("truncated {} record; skipping remainder", desc.name);
                break;
            }
            let payload = &self.profile[pos..pos + desc.size];
            pos += desc.size;

            match desc.kind {
                RecordKind::SampleGroup => {
                    /* Tokenize by the declared sub-field sizes. */
                    let mut offset = 0;
                    for &(name, size) in desc.subtypes {
                        let raw = u16::from_le_bytes([payload[offset], payload[offset + 1]]);
                        offset += size;
                        match name {
                            "Time" => callback(Sample::Time(raw as u32 * TIME_UNIT_MS)),
                            "Depth" => {
                                if raw != NIL16 {
                                    callback(Sample::Depth(raw as f64 / 100.0));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                RecordKind::Temperature => {
                    let raw = u16::from_le_bytes([payload[0], payload[1]]);
                    if raw != NIL16 {
                        callback(Sample::Temperature(raw as f64 / 10.0));
                    }
                }
                RecordKind::Pressure => {
                    let bar = u16::from_le_bytes([payload[1], payload[2]]) as f64 / 100.0;
                    callback(Sample::Pressure {
                        tank: payload[0] as usize,
                        bar,
                    });
                }
                RecordKind::GasMix => {
                    callback(Sample::GasMix(payload[0] as usize));
                }
                RecordKind::Deco => {
                    let kind = match payload[0] {
                        0 => DecoKind::NoDecoLimit,
                        1 => DecoKind::SafetyStop,
                        _ => DecoKind::DecoStop,
                    };
                    callback(Sample::Deco(DecoStatus {
                        kind,
                        depth: u16::from_le_bytes([payload[1], payload[2]]) as f64 / 100.0,
                        time: u16::from_le_bytes([payload[3], payload[4]]) as u32,
                        tts: u16::from_le_bytes([payload[5], payload[6]]) as u32,
                    }));
                }
                RecordKind::Setpoint => {
                    let bar = u16::from_le_bytes([payload[0], payload[1]]) as f64 / 100.0;
                    callback(Sample::Setpoint(bar));
                }
                RecordKind::Ppo2 => {
                    let bar = u16::from_le_bytes([payload[1], payload[2]]) as f64 / 100.0;
                    callback(Sample::Ppo2 {
                        sensor: payload[0],
                        bar,
                    });
                }
                RecordKind::Cns => {
                    let raw = u16::from_le_bytes([payload[0], payload[1]]);
                    callback(Sample::Cns(raw as f64 / 1000.0));
                }
                RecordKind::Bearing => {
                    callback(Sample::Bearing(u16::from_le_bytes([payload[0], payload[1]])));
                }
                RecordKind::Rbt => {
                    callback(Sample::Rbt(
                        u16::from_le_bytes([payload[0], payload[1]]) as u32
                    ));
                }
                RecordKind::Event => {
                    let kind = event_name(payload[0]).and_then(normalize_event);
                    if let Some(kind) = kind {
                        callback(Sample::Event {
                            kind,
                            flags: EventFlags::from_begin(payload[1] != 0),
                            value: u16::from_le_bytes([payload[2], payload[3]]) as u32,
                        });
                    }
                }
                RecordKind::Vendor => {
                    callback(Sample::Vendor {
                        kind: desc.id,
                        data: payload,
                    });
                }
            }
        }
        Ok(())
    }
}
