/// Dive Rite NiTek Q driver.
///
/// A legacy serial protocol: commands and most replies travel as ASCII-hex
/// envelopes `<payload checksum>` whose checksum is the byte sum of the hex
/// characters, and the device echoes every transmitted byte. Bulk profile
/// data streams as binary 32-byte pages, each page sent twice with
/// independent additive checksums so the host can pick whichever copy is
/// intact.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::checksum::sum8;
use crate::context::Context;
use crate::device::{
    DeviceBase, DiveCallback, FamilyDriver, NSTEPS, Progress, assemble_blob, with_retries,
};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::iostream::{
    Direction, IoStream, SerialParams, Timeout, Transport, read_exact, write_all,
};
use crate::ringbuffer::distance;

/* ------------------------------------------------------------------ */
/* Protocol constants                                                  */
/* ------------------------------------------------------------------ */

const CMD_IDENT: u8 = 0x49;
const CMD_STATUS: u8 = 0x4E;
const CMD_READ: u8 = 0x51;
const CMD_READ_BULK: u8 = 0x52;

const START: u8 = b'<';
const END: u8 = b'>';

pub(crate) const PAGE_SIZE: usize = 32;

/* Device memory map. */
const LOGBOOK_BEGIN: usize = 0x000200;
pub(crate) const LOGBOOK_ENTRY_SIZE: usize = 32;
const PROFILE_BEGIN: usize = 0x001000;
const PROFILE_SIZE: usize = 0x010000;

pub(crate) const FINGERPRINT_SIZE: usize = 6;

const EXCHANGE_RETRIES: u32 = 2;

pub(crate) struct NitekQ {
    base: DeviceBase,
    ident: [u8; PAGE_SIZE],
}

/* Uppercase hex encoding of a byte string. */
fn to_hex(data: &[u8]) -> Vec<u8> {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        out.push(DIGITS[(byte >> 4) as usize]);
        out.push(DIGITS[(byte & 0x0F) as usize]);
    }
    out
}

fn from_hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(Error::Protocol("invalid hex digit")),
    }
}

fn from_hex(chars: &[u8]) -> Result<Vec<u8>> {
    if chars.len() % 2 != 0 {
        return Err(Error::Protocol("odd hex payload length"));
    }
    let mut out = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks(2) {
        out.push((from_hex_digit(pair[0])? << 4) | from_hex_digit(pair[1])?);
    }
    Ok(out)
}

/* Build `<hex(payload) checksum>` where the checksum is the byte sum of   */
/* the payload's hex characters, itself written as two hex digits.         */
fn encode_envelope(payload: &[u8]) -> Vec<u8> {
    let hex = to_hex(payload);
    let checksum = sum8(&hex, 0);

    let mut envelope = Vec::with_capacity(hex.len() + 4);
    envelope.push(START);
    envelope.extend_from_slice(&hex);
    envelope.extend_from_slice(&to_hex(&[checksum]));
    envelope.push(END);
    envelope
}

/* Validate a received envelope and return the decoded payload bytes. */
fn decode_envelope(envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < 4 || envelope[0] != START || *envelope.last().unwrap() != END {
        return Err(Error::Protocol("malformed envelope"));
    }
    let body = &envelope[1..envelope.len() - 1];
    let (hex, checksum_chars) = body.split_at(body.len() - 2);

    let received = (from_hex_digit(checksum_chars[0])? << 4) | from_hex_digit(checksum_chars[1])?;
    if sum8(hex, 0) != received {
        return Err(Error::Protocol("envelope checksum mismatch"));
    }
    from_hex(hex)
}

/* Pick the intact copy out of a doubled 32-byte sub-packet pair. Each     */
/* copy carries its own additive checksum; the first valid copy wins.      */
fn arbitrate_page(pair: &[u8]) -> Result<&[u8]> {
    let (first, first_sum) = (&pair[..PAGE_SIZE], pair[PAGE_SIZE]);
    let (second, second_sum) = (
        &pair[PAGE_SIZE + 1..PAGE_SIZE + 1 + PAGE_SIZE],
        pair[2 * PAGE_SIZE + 1],
    );

    let first_ok = sum8(first, 0) == first_sum;
    let second_ok = sum8(second, 0) == second_sum;

    match (first_ok, second_ok) {
        (true, true) => {
            if first != second {
                warn!("doubled page copies disagree; keeping the first");
            }
            Ok(first)
        }
        (true, false) => Ok(first),
        (false, true) => Ok(second),
        (false, false) => Err(Error::Protocol("both page copies corrupted")),
    }
}

impl NitekQ {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        if stream.transport() == Transport::Serial {
            stream.configure(&SerialParams::new(9600))?;
            stream.set_dtr(true)?;
        }
        stream.set_timeout(Timeout::from_ms(1000))?;
        stream.purge(Direction::All)?;
        stream.sleep(100);

        let mut base = DeviceBase::new(Arc::clone(context), stream);

        let reply = Self::transfer(&mut base, &[CMD_IDENT], PAGE_SIZE)?;
        let mut ident = [0u8; PAGE_SIZE];
        ident.copy_from_slice(&reply);
        debug!("identified NiTek Q, serial {:02x?}", &ident[2..6]);

        Ok(Self { base, ident })
    }

    /* Send one command envelope, drain and verify the echo, and decode    */
    /* the enveloped reply of `reply_len` payload bytes.                   */
    fn transfer(base: &mut DeviceBase, command: &[u8], reply_len: usize) -> Result<Vec<u8>> {
        let envelope = encode_envelope(command);

        with_retries(base, EXCHANGE_RETRIES, |base| {
            write_all(&mut *base.stream, &envelope)?;

            let mut echo = vec![0u8; envelope.len()];
            read_exact(&mut *base.stream, &mut echo)?;
            if echo != envelope {
                return Err(Error::Protocol("command echo mismatch"));
            }

            let mut reply = vec![0u8; 2 * reply_len + 4];
            read_exact(&mut *base.stream, &mut reply)?;
            let payload = decode_envelope(&reply)?;
            if payload.len() != reply_len {
                return Err(Error::Protocol("unexpected reply length"));
            }
            Ok(payload)
        })
    }

    /* Bulk-read `npages` doubled pages starting at a device address. */
    fn read_bulk(base: &mut DeviceBase, address: usize, npages: usize) -> Result<Vec<u8>> {
        let command = [
            CMD_READ_BULK,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
            npages as u8,
        ];
        let envelope = encode_envelope(&command);

        with_retries(base, EXCHANGE_RETRIES, |base| {
            write_all(&mut *base.stream, &envelope)?;

            let mut echo = vec![0u8; envelope.len()];
            read_exact(&mut *base.stream, &mut echo)?;
            if echo != envelope {
                return Err(Error::Protocol("command echo mismatch"));
            }

            let mut out = Vec::with_capacity(npages * PAGE_SIZE);
            for _ in 0..npages {
                let mut pair = [0u8; 2 * (PAGE_SIZE + 1)];
                read_exact(&mut *base.stream, &mut pair)?;
                out.extend_from_slice(arbitrate_page(&pair)?);
            }
            Ok(out)
        })
    }

    /* Read a profile span out of the circular region, wrapping at the     */
    /* ring boundary with a second bulk read.                              */
    fn read_profile(base: &mut DeviceBase, begin: usize, end: usize) -> Result<Vec<u8>> {
        let length = distance(begin, end, 0, PROFILE_SIZE);
        if length == 0 {
            return Err(Error::DataFormat("empty profile span"));
        }

        let mut profile = Vec::with_capacity(length);
        if begin < end {
            let npages = (end - begin).div_ceil(PAGE_SIZE);
            profile.extend_from_slice(&Self::read_bulk(base, PROFILE_BEGIN + begin, npages)?);
        } else {
            let head = (PROFILE_SIZE - begin).div_ceil(PAGE_SIZE);
            profile.extend_from_slice(&Self::read_bulk(base, PROFILE_BEGIN + begin, head)?);
            profile.truncate(PROFILE_SIZE - begin);
            let tail = end.div_ceil(PAGE_SIZE);
            profile.extend_from_slice(&Self::read_bulk(base, PROFILE_BEGIN, tail)?);
        }
        profile.truncate(length);
        Ok(profile)
    }
}

impl FamilyDriver for NitekQ {
    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn fingerprint_size(&self) -> usize {
        FINGERPRINT_SIZE
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.emit(DeviceEvent::DevInfo {
            model: self.ident[0] as u32,
            firmware: self.ident[1] as u32,
            serial: u32::from_le_bytes([
                self.ident[2],
                self.ident[3],
                self.ident[4],
                self.ident[5],
            ]),
        });

        let status = Self::transfer(&mut self.base, &[CMD_STATUS], PAGE_SIZE)?;
        let ndives = u16::from_le_bytes([status[0], status[1]]) as usize;
        debug!("logbook holds {ndives} dives");

        let mut progress = Progress::new(&mut self.base, (ndives as u32 + 1) * NSTEPS);
        progress.advance(&mut self.base, NSTEPS);

        for index in (0..ndives).rev() {
            self.base.check_cancel()?;

            let address = LOGBOOK_BEGIN + index * LOGBOOK_ENTRY_SIZE;
            let entry = Self::transfer(
                &mut self.base,
                &[
                    CMD_READ,
                    (address >> 16) as u8,
                    (address >> 8) as u8,
                    address as u8,
                    1,
                ],
                LOGBOOK_ENTRY_SIZE,
            )?;

            let begin = u16::from_le_bytes([entry[14], entry[15]]) as usize;
            let end = u16::from_le_bytes([entry[16], entry[17]]) as usize;
            let profile = Self::read_profile(&mut self.base, begin, end)?;

            if profile.len() < FINGERPRINT_SIZE {
                return Err(Error::DataFormat("profile shorter than its timestamp"));
            }
            if self.base.fingerprint_matches(&profile[..FINGERPRINT_SIZE]) {
                break;
            }

            let blob = assemble_blob(&self.ident, &entry, &profile);
            let fp_offset = 2 + self.ident.len() + entry.len();
            let keep_going = callback(&blob, &blob[fp_offset..fp_offset + FINGERPRINT_SIZE]);

            progress.advance(&mut self.base, NSTEPS);
            if !keep_going {
                return Ok(());
            }
        }

        progress.finish(&mut self.base);
        Ok(())
    }
}
