/* The normalized sample stream parsers emit, and the closed event
 * vocabulary family-specific event strings are mapped onto. */
use serde::Serialize;

/* Decompression state attached to a sample. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecoKind {
    NoDecoLimit,
    SafetyStop,
    DecoStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DecoStatus {
    pub kind: DecoKind,
    /* Stop or ceiling depth in metres. */
    pub depth: f64,
    /* Stop or no-deco time in seconds. */
    pub time: u32,
    /* Time-to-surface estimate in seconds. */
    pub tts: u32,
}

/* Normalized profile events. Family-specific strings outside this set    */
/* produce no event at all.                                               */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    AscentRateExceeded,
    Bookmark,
    CeilingBroken,
    DecoViolation,
    Po2High,
    Po2Low,
    SafetyStopBroken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const BEGIN: EventFlags = EventFlags(1 << 0);
    pub const END: EventFlags = EventFlags(1 << 1);

    pub fn has_begin(self) -> bool {
        self.0 & Self::BEGIN.0 != 0
    }

    pub fn has_end(self) -> bool {
        self.0 & Self::END.0 != 0
    }

    /* Begin/End from the boolean most devices record alongside events. */
    pub fn from_begin(begin: bool) -> Self {
        if begin { Self::BEGIN } else { Self::END }
    }
}

/* One element of the sample stream. Values use SI-adjacent dive units:   */
/* metres, bar, degrees Celsius, milliseconds.                            */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Sample<'a> {
    /* Elapsed dive time. Non-decreasing within one dive. */
    Time(u32),
    Depth(f64),
    Temperature(f64),
    Pressure { tank: usize, bar: f64 },
    /* Switch to a mix in the dive's gas table. */
    GasMix(usize),
    Deco(DecoStatus),
    Setpoint(f64),
    Ppo2 { sensor: u8, bar: f64 },
    Bearing(u16),
    /* Remaining bottom time in minutes. */
    Rbt(u32),
    /* CNS oxygen toxicity as a fraction (1.0 = 100%). */
    Cns(f64),
    Event {
        kind: EventKind,
        flags: EventFlags,
        value: u32,
    },
    /* Family-specific payload the normalized model has no slot for. */
    Vendor { kind: u16, data: &'a [u8] },
}

/* Map of family event strings onto the normalized vocabulary, sorted     */
/* by name.                                                               */
static EVENT_NAMES: &[(&str, EventKind)] = &[
    ("Ascent Rate Exceeded", EventKind::AscentRateExceeded),
    ("Bookmark", EventKind::Bookmark),
    ("Ceiling Broken", EventKind::CeilingBroken),
    ("Deco Violation", EventKind::DecoViolation),
    ("PO2 High", EventKind::Po2High),
    ("PO2 Low", EventKind::Po2Low),
    ("Safety Stop Broken", EventKind::SafetyStopBroken),
];

/* Unknown strings yield `None`: the event is dropped, not an error. */
pub(crate) fn normalize_event(name: &str) -> Option<EventKind> {
    EVENT_NAMES
        .binary_search_by(|(n, _)| n.cmp(&name))
        .ok()
        .map(|i| EVENT_NAMES[i].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_strings_normalize() {
        assert_eq!(
            normalize_event("Safety Stop Broken"),
            Some(EventKind::SafetyStopBroken)
        );
        assert_eq!(normalize_event("PO2 High"), Some(EventKind::Po2High));
        assert_eq!(normalize_event("Bookmark"), Some(EventKind::Bookmark));
    }

    #[test]
    fn unknown_event_strings_drop() {
        assert_eq!(normalize_event("Battery Cover Open"), None);
        assert_eq!(normalize_event(""), None);
    }

    #[test]
    fn flags_from_begin_bool() {
        assert!(EventFlags::from_begin(true).has_begin());
        assert!(!EventFlags::from_begin(true).has_end());
        assert!(EventFlags::from_begin(false).has_end());
    }
}
