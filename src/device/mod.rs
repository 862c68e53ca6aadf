/* Device framework: the FamilyDriver trait all protocol families
 * implement, the shared DeviceBase state block (stream, events,
 * cancellation, fingerprint), the bounded-retry and progress-accounting
 * helpers, and the public Device dispatcher. */
pub mod cressi;
pub mod diverite;
pub mod divesoft;
pub mod reefnet;
pub mod seac;
pub mod suunto;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::datetime::DateTime;
use crate::descriptor::{Descriptor, Family};
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, EventMask};
use crate::iostream::{Direction, IoStream};

/* Steps per dive in the progress scale: `maximum` is revised to          */
/* `(count + 1) * NSTEPS` once the dive count is known.                   */
pub(crate) const NSTEPS: u32 = 1000;

/* Settle delay between a failed exchange and its retry. */
const RETRY_BACKOFF_MS: u64 = 100;

pub type DiveCallback<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> bool;

/* State shared by every family driver. The stream is uniquely owned;     */
/* nothing in here reaches back into the driver.                          */
pub(crate) struct DeviceBase {
    #[allow(dead_code)]
    pub(crate) context: Arc<Context>,
    pub(crate) stream: Box<dyn IoStream>,
    events: EventMask,
    event_cb: Option<Box<dyn FnMut(&DeviceEvent) + Send>>,
    cancel_cb: Option<Box<dyn Fn() -> bool + Send>>,
    pub(crate) fingerprint: Vec<u8>,
}

impl DeviceBase {
    pub(crate) fn new(context: Arc<Context>, stream: Box<dyn IoStream>) -> Self {
        Self {
            context,
            stream,
            events: EventMask::empty(),
            event_cb: None,
            cancel_cb: None,
            fingerprint: Vec::new(),
        }
    }

    pub(crate) fn set_events(
        &mut self,
        mask: EventMask,
        callback: Box<dyn FnMut(&DeviceEvent) + Send>,
    ) {
        self.events = mask;
        self.event_cb = Some(callback);
    }

    pub(crate) fn set_cancel(&mut self, callback: Box<dyn Fn() -> bool + Send>) {
        self.cancel_cb = Some(callback);
    }

    pub(crate) fn emit(&mut self, event: DeviceEvent) {
        if !self.events.accepts(&event) {
            return;
        }
        if let Some(cb) = &mut self.event_cb {
            cb(&event);
        }
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel_cb.as_ref().is_some_and(|cb| cb())
    }

    /* Cancellation checkpoint between command round trips. Leaves the    */
    /* stream purge-recovered so the next public call can still proceed.  */
    pub(crate) fn check_cancel(&mut self) -> Result<()> {
        if self.cancelled() {
            let _ = self.stream.purge(Direction::All);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /* Byte-equality test against the stored fingerprint; an empty store  */
    /* matches nothing.                                                   */
    pub(crate) fn fingerprint_matches(&self, fp: &[u8]) -> bool {
        !self.fingerprint.is_empty() && self.fingerprint == fp
    }
}

/* Run one packet exchange with the family's bounded retry policy:
 * transient failures (timeout, framing/checksum mismatch) purge the input
 * side, settle briefly and try again; I/O and access errors and
 * cancellation propagate unchanged. */
pub(crate) fn with_retries<T>(
    base: &mut DeviceBase,
    retries: u32,
    mut attempt: impl FnMut(&mut DeviceBase) -> Result<T>,
) -> Result<T> {
    base.check_cancel()?;

    let mut failures = 0;
    loop {
        match attempt(base) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && failures < retries => {
                failures += 1;
                warn!("exchange failed ({err}), retry {failures}/{retries}");
                if matches!(err, Error::Timeout) {
                    base.emit(DeviceEvent::Waiting);
                }
                let _ = base.stream.purge(Direction::Input);
                base.stream.sleep(RETRY_BACKOFF_MS);
                base.check_cancel()?;
            }
            Err(err) => return Err(err),
        }
    }
}

/* Running (current, maximum) progress reporter. */
pub(crate) struct Progress {
    current: u32,
    maximum: u32,
}

impl Progress {
    pub(crate) fn new(base: &mut DeviceBase, maximum: u32) -> Self {
        let progress = Self {
            current: 0,
            maximum,
        };
        base.emit(DeviceEvent::Progress {
            current: 0,
            maximum,
        });
        progress
    }

    /* Revise the scale once the dive count is known. */
    pub(crate) fn set_maximum(&mut self, base: &mut DeviceBase, maximum: u32) {
        self.maximum = maximum;
        self.emit(base);
    }

    pub(crate) fn advance(&mut self, base: &mut DeviceBase, delta: u32) {
        self.current = (self.current + delta).min(self.maximum);
        self.emit(base);
    }

    pub(crate) fn finish(&mut self, base: &mut DeviceBase) {
        self.current = self.maximum;
        self.emit(base);
    }

    fn emit(&self, base: &mut DeviceBase) {
        base.emit(DeviceEvent::Progress {
            current: self.current,
            maximum: self.maximum,
        });
    }
}

/* Assemble the self-contained dive blob for families whose logbook and    */
/* profile live apart: `[id_len, logbook_len, id, logbook, dive]`.         */
pub(crate) fn assemble_blob(id: &[u8], logbook: &[u8], dive: &[u8]) -> Vec<u8> {
    debug_assert!(id.len() <= u8::MAX as usize);
    debug_assert!(logbook.len() <= u8::MAX as usize);

    let mut blob = Vec::with_capacity(2 + id.len() + logbook.len() + dive.len());
    blob.push(id.len() as u8);
    blob.push(logbook.len() as u8);
    blob.extend_from_slice(id);
    blob.extend_from_slice(logbook);
    blob.extend_from_slice(dive);
    blob
}

/* Split a blob assembled by `assemble_blob` into (id, logbook, dive). */
pub(crate) fn split_blob(blob: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    if blob.len() < 2 {
        return Err(Error::DataFormat("dive blob shorter than its size header"));
    }
    let id_len = blob[0] as usize;
    let logbook_len = blob[1] as usize;
    if blob.len() < 2 + id_len + logbook_len {
        return Err(Error::DataFormat("dive blob truncated"));
    }
    let id = &blob[2..2 + id_len];
    let logbook = &blob[2 + id_len..2 + id_len + logbook_len];
    let dive = &blob[2 + id_len + logbook_len..];
    Ok((id, logbook, dive))
}

/* The per-family driver contract. The base layer dispatches public calls  */
/* straight through; families own the whole protocol state machine.        */
pub(crate) trait FamilyDriver: Send {
    fn base_mut(&mut self) -> &mut DeviceBase;

    /* Width of this family's fingerprint in bytes. */
    fn fingerprint_size(&self) -> usize;

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()>;

    fn dump(&mut self, _buffer: &mut Buffer) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn timesync(&mut self, _datetime: &DateTime) -> Result<()> {
        Err(Error::Unsupported)
    }

    /* Send the family's goodbye command, if any, then release the stream. */
    fn close(&mut self) -> Result<()> {
        self.base_mut().stream.close()
    }
}

/* An opened dive computer. Not safe for concurrent use; the host          */
/* serializes all operations.                                              */
pub struct Device {
    driver: Box<dyn FamilyDriver>,
}

impl Device {
    /* Configure the stream for the descriptor's family, perform the wake- */
    /* up/identify sequence and return the ready device.                   */
    pub fn open(
        context: &Arc<Context>,
        descriptor: &Descriptor,
        stream: Box<dyn IoStream>,
    ) -> Result<Self> {
        debug!(
            "opening {} {} over {}",
            descriptor.vendor,
            descriptor.product,
            stream.transport()
        );

        let driver: Box<dyn FamilyDriver> = match descriptor.family {
            Family::SuuntoVyper => Box::new(suunto::SuuntoVyper::open(context, stream)?),
            Family::ReefnetSensusUltra => {
                Box::new(reefnet::SensusUltra::open(context, stream)?)
            }
            Family::DiveriteNitekQ => Box::new(diverite::NitekQ::open(context, stream)?),
            Family::CressiLeonardo => Box::new(cressi::Leonardo::open(context, stream)?),
            Family::SeacScreen => Box::new(seac::Screen::open(context, stream)?),
            Family::DivesoftFreedom => Box::new(divesoft::Freedom::open(context, stream)?),
        };

        Ok(Self { driver })
    }

    pub fn set_events<F>(&mut self, mask: EventMask, callback: F)
    where
        F: FnMut(&DeviceEvent) + Send + 'static,
    {
        self.driver.base_mut().set_events(mask, Box::new(callback));
    }

    pub fn set_cancel<F>(&mut self, callback: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.driver.base_mut().set_cancel(Box::new(callback));
    }

    /* Install the "already seen" marker. The width must match the family; */
    /* an empty slice clears it.                                           */
    pub fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<()> {
        if !fingerprint.is_empty() && fingerprint.len() != self.driver.fingerprint_size() {
            return Err(Error::InvalidArgs("fingerprint width mismatch"));
        }
        let base = self.driver.base_mut();
        base.fingerprint.clear();
        base.fingerprint.extend_from_slice(fingerprint);
        Ok(())
    }

    /* Download and deliver every dive not already seen, newest first. */
    pub fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.driver.foreach(callback)
    }

    /* Read the entire raw memory image, where the family supports it. */
    pub fn dump(&mut self, buffer: &mut Buffer) -> Result<()> {
        self.driver.dump(buffer)
    }

    /* Write the wall-clock to the device, where the family supports it. */
    pub fn timesync(&mut self, datetime: &DateTime) -> Result<()> {
        self.driver.timesync(datetime)
    }

    pub fn close(&mut self) -> Result<()> {
        self.driver.close()
    }
}
