/* Device events delivered synchronously from driver code, and the opt-in
 * mask hosts use to subscribe. */
use serde::{Deserialize, Serialize};

use crate::datetime::DateTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /* The stream stalled; the driver is waiting on the device. */
    Waiting,
    Progress {
        current: u32,
        maximum: u32,
    },
    DevInfo {
        model: u32,
        firmware: u32,
        serial: u32,
    },
    /* Host wall-clock and device clock sampled at the same instant. */
    Clock {
        systime: DateTime,
        devtime: u32,
    },
    /* Family-specific blob for hosts that want the raw identification. */
    Vendor(Vec<u8>),
}

impl DeviceEvent {
    fn bit(&self) -> u8 {
        match self {
            DeviceEvent::Waiting => 1 << 0,
            DeviceEvent::Progress { .. } => 1 << 1,
            DeviceEvent::DevInfo { .. } => 1 << 2,
            DeviceEvent::Clock { .. } => 1 << 3,
            DeviceEvent::Vendor(_) => 1 << 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const WAITING: EventMask = EventMask(1 << 0);
    pub const PROGRESS: EventMask = EventMask(1 << 1);
    pub const DEVINFO: EventMask = EventMask(1 << 2);
    pub const CLOCK: EventMask = EventMask(1 << 3);
    pub const VENDOR: EventMask = EventMask(1 << 4);

    pub const fn empty() -> Self {
        EventMask(0)
    }

    pub const fn all() -> Self {
        EventMask(0x1F)
    }

    pub const fn union(self, other: EventMask) -> Self {
        EventMask(self.0 | other.0)
    }

    pub fn accepts(self, event: &DeviceEvent) -> bool {
        self.0 & event.bit() != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.union(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_subscription() {
        let mask = EventMask::PROGRESS | EventMask::DEVINFO;
        assert!(mask.accepts(&DeviceEvent::Progress {
            current: 0,
            maximum: 10
        }));
        assert!(mask.accepts(&DeviceEvent::DevInfo {
            model: 1,
            firmware: 2,
            serial: 3
        }));
        assert!(!mask.accepts(&DeviceEvent::Waiting));
        assert!(EventMask::all().accepts(&DeviceEvent::Waiting));
        assert!(!EventMask::empty().accepts(&DeviceEvent::Vendor(vec![])));
    }
}
