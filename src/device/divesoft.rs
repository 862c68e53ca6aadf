/// Divesoft Freedom / Liberty driver.
///
/// The rebreather computers speak a message protocol over HDLC frames: a
/// sequence/fragment byte, flags, a little-endian message type and length,
/// then the payload. Long replies span several frames; the final fragment
/// carries the `last` flag and the host concatenates the payloads.
use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::datetime::DateTime;
use crate::device::{
    DeviceBase, DiveCallback, FamilyDriver, NSTEPS, Progress, assemble_blob, with_retries,
};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::iostream::hdlc::HdlcStream;
use crate::iostream::{Direction, IoStream, SerialParams, Timeout, Transport};

/* ------------------------------------------------------------------ */
/* Protocol constants                                                  */
/* ------------------------------------------------------------------ */

const MSG_IDENT: u16 = 0x0010;
const MSG_COUNT: u16 = 0x0011;
const MSG_HEADER: u16 = 0x0012;
const MSG_PROFILE: u16 = 0x0013;
const MSG_CLOCK: u16 = 0x0014;

/* Final fragment of a message. */
const FLAG_LAST: u8 = 0x01;

/* Maximum payload per HDLC frame, each direction. */
const MAX_FRAME: usize = 2048;

const FRAME_HEADER_SIZE: usize = 6;

const EXCHANGE_RETRIES: u32 = 2;

pub(crate) const HEADER_SIZE: usize = 32;
pub(crate) const FINGERPRINT_SIZE: usize = 8;

pub(crate) struct Freedom {
    base: DeviceBase,
    seq: u8,
    ident: Ident,
}

#[derive(Debug, Clone, Copy)]
struct Ident {
    model: u8,
    firmware: u16,
    serial: u32,
}

/* Build one message frame: `(seq << 4 | fragment) | flags | type | len`  */
/* followed by the fragment payload. The HDLC layer adds the FCS.         */
fn build_frame(seq: u8, fragment: u8, last: bool, msg_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.push((seq << 4) | (fragment & 0x0F));
    frame.push(if last { FLAG_LAST } else { 0 });
    frame.extend_from_slice(&msg_type.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

impl Freedom {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        let ble = stream.transport() == Transport::Ble;
        if stream.transport() == Transport::Serial {
            stream.configure(&SerialParams::new(115_200))?;
        }
        stream.set_timeout(Timeout::from_ms(if ble { 5000 } else { 3000 }))?;
        stream.purge(Direction::All)?;

        let framed: Box<dyn IoStream> = Box::new(HdlcStream::new(stream, MAX_FRAME, MAX_FRAME));
        let mut base = DeviceBase::new(Arc::clone(context), framed);

        let mut seq = 0;
        let reply = Self::exchange(&mut base, &mut seq, MSG_IDENT, &[])?;
        if reply.len() < 8 {
            return Err(Error::Protocol("short identification reply"));
        }
        let ident = Ident {
            model: reply[0],
            firmware: u16::from_le_bytes([reply[2], reply[3]]),
            serial: u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]),
        };
        debug!(
            "identified model {:#04x}, firmware {}, serial {}",
            ident.model, ident.firmware, ident.serial
        );

        Ok(Self { base, seq, ident })
    }

    /* One request/response message exchange, concatenating reply          */
    /* fragments until the `last` flag.                                    */
    fn exchange(
        base: &mut DeviceBase,
        seq: &mut u8,
        msg_type: u16,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let request = build_frame(*seq, 0, true, msg_type, payload);
        let current = *seq;
        *seq = (*seq + 1) & 0x0F;

        with_retries(base, EXCHANGE_RETRIES, |base| {
            crate::iostream::write_all(&mut *base.stream, &request)?;

            let mut message = Vec::new();
            let mut fragment = 0u8;
            loop {
                let mut frame = vec![0u8; MAX_FRAME + FRAME_HEADER_SIZE];
                let n = base.stream.read(&mut frame)?;
                let frame = &frame[..n];

                if frame.len() < FRAME_HEADER_SIZE {
                    return Err(Error::Protocol("frame shorter than its header"));
                }
                if frame[0] >> 4 != current {
                    return Err(Error::Protocol("reply sequence mismatch"));
                }
                if frame[0] & 0x0F != fragment {
                    return Err(Error::Protocol("reply fragment out of order"));
                }
                if u16::from_le_bytes([frame[2], frame[3]]) != msg_type {
                    return Err(Error::Protocol("reply type mismatch"));
                }
                let len = u16::from_le_bytes([frame[4], frame[5]]) as usize;
                if frame.len() != FRAME_HEADER_SIZE + len {
                    return Err(Error::Protocol("frame length mismatch"));
                }

                message.extend_from_slice(&frame[FRAME_HEADER_SIZE..]);
                if frame[1] & FLAG_LAST != 0 {
                    return Ok(message);
                }
                fragment = fragment.wrapping_add(1) & 0x0F;
            }
        })
    }
}

impl FamilyDriver for Freedom {
    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn fingerprint_size(&self) -> usize {
        FINGERPRINT_SIZE
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        self.base.emit(DeviceEvent::DevInfo {
            model: self.ident.model as u32,
            firmware: self.ident.firmware as u32,
            serial: self.ident.serial,
        });

        let reply = Self::exchange(&mut self.base, &mut self.seq, MSG_COUNT, &[])?;
        if reply.len() < 2 {
            return Err(Error::Protocol("short dive count reply"));
        }
        let count = u16::from_le_bytes([reply[0], reply[1]]);
        debug!("device holds {count} dives");

        let mut progress = Progress::new(&mut self.base, (count as u32 + 1) * NSTEPS);
        progress.advance(&mut self.base, NSTEPS);

        for index in 0..count {
            self.base.check_cancel()?;

            let header = Self::exchange(
                &mut self.base,
                &mut self.seq,
                MSG_HEADER,
                &index.to_le_bytes(),
            )?;
            if header.len() != HEADER_SIZE {
                return Err(Error::DataFormat("unexpected logbook header size"));
            }

            /* The fingerprint lives in the header, so known dives cost    */
            /* one small exchange instead of a profile download.           */
            if self.base.fingerprint_matches(&header[..FINGERPRINT_SIZE]) {
                break;
            }

            let profile = Self::exchange(
                &mut self.base,
                &mut self.seq,
                MSG_PROFILE,
                &index.to_le_bytes(),
            )?;

            let blob = assemble_blob(&[], &header, &profile);
            let keep_going = callback(&blob, &blob[2..2 + FINGERPRINT_SIZE]);

            progress.advance(&mut self.base, NSTEPS);
            if !keep_going {
                return Ok(());
            }
        }

        progress.finish(&mut self.base);
        Ok(())
    }

    fn timesync(&mut self, datetime: &DateTime) -> Result<()> {
        let payload = [
            (datetime.year.saturating_sub(2000)) as u8,
            datetime.month,
            datetime.day,
            datetime.hour,
            datetime.minute,
            datetime.second,
        ];
        Self::exchange(&mut self.base, &mut self.seq, MSG_CLOCK, &payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::memory::{Exchange, MemoryStream};

    fn ident_reply() -> Vec<u8> {
        let mut reply = vec![0x19, 0x01];
        reply.extend_from_slice(&312u16.to_le_bytes());
        reply.extend_from_slice(&42_000u32.to_le_bytes());
        reply
    }

    fn logbook_header(id: u32, day: u8) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&id.to_le_bytes());
        header[4..10].copy_from_slice(&[24, 8, day, 7, 45, 0]);
        header[10..12].copy_from_slice(&2400u16.to_le_bytes());
        header[12..14].copy_from_slice(&4500u16.to_le_bytes());
        header[14] = 1; /* closed circuit */
        header[15] = 0; /* Buhlmann */
        header[16..18].copy_from_slice(&1013u16.to_le_bytes());
        header[19] = 2;
        header[20..24].copy_from_slice(&[21, 0, 18, 45]);
        header
    }

    /* Wire bytes for one single-frame exchange. */
    fn single_frame_exchange(seq: u8, msg_type: u16, payload: &[u8], reply: &[u8]) -> Exchange {
        Exchange::call(
            &HdlcStream::encode(&build_frame(seq, 0, true, msg_type, payload)),
            &HdlcStream::encode(&build_frame(seq, 0, true, msg_type, reply)),
        )
    }

    fn open_device(script: Vec<Exchange>) -> Freedom {
        let mut full = vec![single_frame_exchange(0, MSG_IDENT, &[], &ident_reply())];
        full.extend(script);
        let context = Arc::new(Context::new());
        let stream = MemoryStream::new(full);
        Freedom::open(&context, Box::new(stream)).unwrap()
    }

    #[test]
    fn open_identifies_over_hdlc() {
        let device = open_device(vec![]);
        assert_eq!(device.ident.model, 0x19);
        assert_eq!(device.ident.firmware, 312);
        assert_eq!(device.ident.serial, 42_000);
        assert_eq!(device.seq, 1);
    }

    #[test]
    fn multi_frame_reply_is_concatenated() {
        /* A profile reply split across three fragments. */
        let profile: Vec<u8> = (0u8..=199).cycle().take(300).collect();

        let mut reply_wire = Vec::new();
        for (i, chunk) in profile.chunks(128).enumerate() {
            let last = (i + 1) * 128 >= profile.len();
            reply_wire.extend(HdlcStream::encode(&build_frame(
                1,
                i as u8,
                last,
                MSG_PROFILE,
                chunk,
            )));
        }

        let script = vec![Exchange::call(
            &HdlcStream::encode(&build_frame(1, 0, true, MSG_PROFILE, &0u16.to_le_bytes())),
            &reply_wire,
        )];
        let mut device = open_device(script);

        let reply = Freedom::exchange(
            &mut device.base,
            &mut device.seq,
            MSG_PROFILE,
            &0u16.to_le_bytes(),
        )
        .unwrap();
        assert_eq!(reply, profile);
    }

    #[test]
    fn foreach_skips_profile_of_known_dive() {
        let newest = logbook_header(7, 20);
        let older = logbook_header(6, 10);
        let profile = vec![0x01, 0x00, 0x02, 0x00, 0x64, 0x00];

        let script = vec![
            single_frame_exchange(1, MSG_COUNT, &[], &2u16.to_le_bytes()),
            single_frame_exchange(2, MSG_HEADER, &0u16.to_le_bytes(), &newest),
            single_frame_exchange(3, MSG_PROFILE, &0u16.to_le_bytes(), &profile),
            single_frame_exchange(4, MSG_HEADER, &1u16.to_le_bytes(), &older),
            /* No profile exchange: the fingerprint matches first. */
        ];
        let mut device = open_device(script);
        device.base.fingerprint = older[..FINGERPRINT_SIZE].to_vec();

        let mut seen = Vec::new();
        device
            .foreach(&mut |blob, fp| {
                seen.push((blob.to_vec(), fp.to_vec()));
                true
            })
            .unwrap();

        assert_eq!(seen.len(), 1);
        let (blob, fp) = &seen[0];
        assert_eq!(blob[0], 0);
        assert_eq!(blob[1] as usize, HEADER_SIZE);
        assert_eq!(&blob[2..2 + HEADER_SIZE], &newest);
        assert_eq!(&blob[2 + HEADER_SIZE..], &profile);
        assert_eq!(fp, &newest[..FINGERPRINT_SIZE]);
    }

    #[test]
    fn timesync_round_trip() {
        let script = vec![single_frame_exchange(
            1,
            MSG_CLOCK,
            &[24, 8, 20, 7, 45, 0],
            &[],
        )];
        let mut device = open_device(script);
        device
            .timesync(&DateTime::new(2024, 8, 20, 7, 45, 0))
            .unwrap();
    }
}
