/* Built-in catalog of supported products: an ordered, immutable table of
 * (vendor, product, family, model, transports, usb ids) entries, iterated
 * by borrowed reference and filtered by transport capabilities. */
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::iostream::{Transport, TransportMask};

/* Protocol family tag shared between descriptors, drivers and parsers. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    SuuntoVyper,
    ReefnetSensusUltra,
    DiveriteNitekQ,
    CressiLeonardo,
    SeacScreen,
    DivesoftFreedom,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::SuuntoVyper => "suunto_vyper",
            Family::ReefnetSensusUltra => "reefnet_sensusultra",
            Family::DiveriteNitekQ => "diverite_nitekq",
            Family::CressiLeonardo => "cressi_leonardo",
            Family::SeacScreen => "seac_screen",
            Family::DivesoftFreedom => "divesoft_freedom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

/* One catalog entry. Iteration hands out `&'static` borrows; nothing is
 * deep-copied. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Descriptor {
    pub vendor: &'static str,
    pub product: &'static str,
    pub family: Family,
    pub model: u32,
    pub transports: TransportMask,
    pub usb: Option<UsbId>,
}

/* Device-reported identity used to narrow USB-HID/BLE candidates. */
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter<'a> {
    pub usb: Option<UsbId>,
    pub name: Option<&'a str>,
}

impl Descriptor {
    /* Whether this entry is a candidate for the given transport and,     */
    /* where the transport reports identity, for the reported ids/name.   */
    pub fn matches(&self, transport: Transport, filter: &DeviceFilter<'_>) -> bool {
        if !self.transports.contains(transport) {
            return false;
        }

        match transport {
            Transport::Usb | Transport::UsbHid => match (filter.usb, self.usb) {
                (Some(reported), Some(expected)) => reported == expected,
                (Some(_), None) => false,
                (None, _) => true,
            },
            Transport::Ble | Transport::Bluetooth => match filter.name {
                Some(name) => name
                    .to_ascii_lowercase()
                    .contains(&self.product.to_ascii_lowercase()),
                None => true,
            },
            _ => true,
        }
    }
}

const SERIAL: TransportMask = TransportMask::of(&[Transport::Serial]);
const SERIAL_IRDA: TransportMask = TransportMask::of(&[Transport::Serial, Transport::Irda]);
const SERIAL_BLE: TransportMask = TransportMask::of(&[Transport::Serial, Transport::Ble]);
const BLE_ONLY: TransportMask = TransportMask::of(&[Transport::Ble]);

/* The catalog is ordered by vendor then product; hosts present it as-is. */
static CATALOG: &[Descriptor] = &[
    Descriptor {
        vendor: "Cressi",
        product: "Leonardo",
        family: Family::CressiLeonardo,
        model: 1,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Cressi",
        product: "Giotto",
        family: Family::CressiLeonardo,
        model: 4,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Cressi",
        product: "Newton",
        family: Family::CressiLeonardo,
        model: 5,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Dive Rite",
        product: "NiTek Q",
        family: Family::DiveriteNitekQ,
        model: 0,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Divesoft",
        product: "Freedom",
        family: Family::DivesoftFreedom,
        model: 19,
        transports: SERIAL_BLE,
        usb: None,
    },
    Descriptor {
        vendor: "Divesoft",
        product: "Liberty",
        family: Family::DivesoftFreedom,
        model: 10,
        transports: SERIAL_BLE,
        usb: None,
    },
    Descriptor {
        vendor: "Reefnet",
        product: "Sensus Ultra",
        family: Family::ReefnetSensusUltra,
        model: 3,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Seac",
        product: "Action",
        family: Family::SeacScreen,
        model: 0x11,
        transports: SERIAL_BLE,
        usb: None,
    },
    Descriptor {
        vendor: "Seac",
        product: "Screen",
        family: Family::SeacScreen,
        model: 0x12,
        transports: SERIAL_BLE,
        usb: None,
    },
    Descriptor {
        vendor: "Seac",
        product: "Tablet",
        family: Family::SeacScreen,
        model: 0x14,
        transports: BLE_ONLY,
        usb: None,
    },
    Descriptor {
        vendor: "Suunto",
        product: "Vyper",
        family: Family::SuuntoVyper,
        model: 0x0A,
        transports: SERIAL_IRDA,
        usb: None,
    },
    Descriptor {
        vendor: "Suunto",
        product: "Cobra",
        family: Family::SuuntoVyper,
        model: 0x0C,
        transports: SERIAL,
        usb: None,
    },
    Descriptor {
        vendor: "Suunto",
        product: "Gekko",
        family: Family::SuuntoVyper,
        model: 0x0D,
        transports: SERIAL,
        usb: None,
    },
];

/* Ordered iteration over the catalog, by borrowed reference. */
pub fn descriptors() -> impl Iterator<Item = &'static Descriptor> {
    CATALOG.iter()
}

/* Catalog entries usable over `transport` and matching the reported ids. */
pub fn filter<'a>(
    transport: Transport,
    device: DeviceFilter<'a>,
) -> impl Iterator<Item = &'static Descriptor> + 'a {
    CATALOG.iter().filter(move |d| d.matches(transport, &device))
}
