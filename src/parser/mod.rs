/* Parser framework: the FamilyParser trait the per-family sample engines
 * implement, the summary field model (dive mode, gas mixes, tanks,
 * salinity, ...), and the public Parser dispatcher over one dive blob. */
pub mod cressi;
pub mod diverite;
pub mod divesoft;
pub mod reefnet;
pub mod seac;
pub mod suunto;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Context;
use crate::datetime::DateTime;
use crate::descriptor::Family;
use crate::error::Result;
use crate::sample::Sample;

/* Summary fields a dive may carry. Index variants address into the       */
/* dive's gas-mix and tank tables.                                        */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    DiveTime,
    MaxDepth,
    AvgDepth,
    Atmospheric,
    TemperatureMin,
    TemperatureMax,
    TemperatureSurface,
    Salinity,
    DiveMode,
    DecoModel,
    GasMixCount,
    GasMix(usize),
    TankCount,
    Tank(usize),
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiveMode {
    OpenCircuit,
    ClosedCircuit,
    Gauge,
    Freedive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoModel {
    Buhlmann,
    Vpm,
    Rgbm,
    Dsat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterKind {
    Fresh,
    Salt,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Salinity {
    pub water: WaterKind,
    /* kg/m3 */
    pub density: f64,
}

impl Salinity {
    pub const FRESH: Salinity = Salinity {
        water: WaterKind::Fresh,
        density: 1000.0,
    };
    pub const SALT: Salinity = Salinity {
        water: WaterKind::Salt,
        density: 1025.0,
    };
}

/* Gas fractions; the remainder after oxygen and helium is nitrogen. */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GasMix {
    pub oxygen: f64,
    pub helium: f64,
}

impl GasMix {
    pub fn from_percent(o2: u8, he: u8) -> Self {
        Self {
            oxygen: o2 as f64 / 100.0,
            helium: he as f64 / 100.0,
        }
    }

    pub fn nitrogen(&self) -> f64 {
        1.0 - self.oxygen - self.helium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TankUnits {
    Metric,
    Imperial,
}

/* Tank description: water capacity in litres, pressures in bar. */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tank {
    pub gasmix: Option<usize>,
    pub volume: f64,
    pub workpressure: f64,
    pub beginpressure: f64,
    pub endpressure: f64,
    pub units: TankUnits,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldValue {
    /* Seconds. */
    Time(u32),
    /* Metres. */
    Depth(f64),
    /* Bar. */
    Pressure(f64),
    /* Degrees Celsius. */
    Temperature(f64),
    Salinity(Salinity),
    Mode(DiveMode),
    Model(DecoModel),
    Count(u32),
    Mix(GasMix),
    Tank(Tank),
    Location(Location),
}

/* Tank volumes are stored unitless; a fractional volume only occurs when */
/* the vendor software recorded imperial cubic feet. The guess cannot be  */
/* undone later, so it is part of the field contract.                     */
pub(crate) fn guess_tank_units(volume: f64, workpressure: f64) -> TankUnits {
    if workpressure > 0.0 && (volume - volume.round()).abs() > 0.001 {
        TankUnits::Imperial
    } else {
        TankUnits::Metric
    }
}

pub(crate) const PSI_TO_BAR: f64 = 0.068_947_572_9;
pub(crate) const ATM_TO_PSI: f64 = 14.695_948_775_5;
pub(crate) const CUFT_TO_LITER: f64 = 28.316_846_592;

/* The per-family parser contract. Implementations borrow the dive blob   */
/* and cache summary fields on the first demand.                          */
pub(crate) trait FamilyParser<'a> {
    fn datetime(&mut self) -> Result<DateTime>;

    fn field(&mut self, kind: FieldKind) -> Result<FieldValue>;

    fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()>;
}

/* A parser over one immutable dive blob. Construction does not copy the  */
/* payload; the parser lives no longer than the bytes it reads.           */
pub struct Parser<'a> {
    inner: Box<dyn FamilyParser<'a> + 'a>,
}

impl<'a> Parser<'a> {
    pub fn new(
        _context: &Arc<Context>,
        family: Family,
        model: u32,
        data: &'a [u8],
    ) -> Result<Self> {
        debug!("parsing {} byte dive for {family} (model {model})", data.len());

        let inner: Box<dyn FamilyParser<'a> + 'a> = match family {
            Family::SuuntoVyper => Box::new(suunto::SuuntoParser::new(data)?),
            Family::ReefnetSensusUltra => Box::new(reefnet::ReefnetParser::new(data)?),
            Family::DiveriteNitekQ => Box::new(diverite::NitekQParser::new(data)?),
            Family::CressiLeonardo => Box::new(cressi::CressiParser::new(data)?),
            Family::SeacScreen => Box::new(seac::SeacParser::new(data)?),
            Family::DivesoftFreedom => Box::new(divesoft::DivesoftParser::new(data)?),
        };
        Ok(Self { inner })
    }

    /* Wall-clock start of the dive; `Unsupported` on families whose      */
    /* hardware only keeps a relative clock.                               */
    pub fn datetime(&mut self) -> Result<DateTime> {
        self.inner.datetime()
    }

    /* Summary field lookup; `Unsupported` for anything the device did    */
    /* not record, `InvalidArgs` for table indices out of range.           */
    pub fn field(&mut self, kind: FieldKind) -> Result<FieldValue> {
        self.inner.field(kind)
    }

    /* Deliver the sample stream in non-decreasing time order. Parsers    */
    /* never mutate the dive, so a second pass repeats the first exactly. */
    pub fn samples_foreach(&mut self, callback: &mut dyn FnMut(Sample<'_>)) -> Result<()> {
        self.inner.samples_foreach(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tank_unit_guess() {
        /* 80 cuft tanks come out fractional; metric litres are integral. */
        assert_eq!(guess_tank_units(11.1, 207.0), TankUnits::Imperial);
        assert_eq!(guess_tank_units(12.0, 232.0), TankUnits::Metric);
        assert_eq!(guess_tank_units(12.0005, 232.0), TankUnits::Metric);
        /* Without a workpressure the volume is taken as metric. */
        assert_eq!(guess_tank_units(11.1, 0.0), TankUnits::Metric);
    }

    #[test]
    fn gasmix_fractions() {
        let ean32 = GasMix::from_percent(32, 0);
        assert!((ean32.oxygen - 0.32).abs() < 1e-9);
        assert!((ean32.nitrogen() - 0.68).abs() < 1e-9);

        let tmx1845 = GasMix::from_percent(18, 45);
        assert!((tmx1845.nitrogen() - 0.37).abs() < 1e-9);
    }
}
