/// Seac Screen family driver.
///
/// A framed request/response protocol shared by the Screen, Action and
/// Tablet. Over serial, every message is wrapped in a triple-0x55 header,
/// a CRC and a trailer byte; dives stream down as fixed-size CRC-protected
/// data packets closed by an end byte. The BLE variant drops the header,
/// the per-packet CRC and the end byte (the transport already guarantees
/// integrity) and terminates the stream with a 16-byte XMODEM EOT blob.
use std::sync::Arc;

use tracing::debug;

use crate::checksum::crc16_ccitt;
use crate::context::Context;
use crate::datetime::DateTime;
use crate::device::{
    DeviceBase, DiveCallback, FamilyDriver, NSTEPS, Progress, with_retries,
};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::iostream::packet::PacketStream;
use crate::iostream::{
    Direction, IoStream, SerialParams, Timeout, Transport, read_exact, write_all,
};

/* ------------------------------------------------------------------ */
/* Protocol constants                                                  */
/* ------------------------------------------------------------------ */

const HEADER: u8 = 0x55;
const TRAILER: u8 = 0xAA;
const ACK: u8 = 0x06;
const END: u8 = 0xEA;
/* XMODEM end-of-transmission, repeated over the whole BLE terminator. */
const EOT: u8 = 0x04;
const EOT_BLOB_SIZE: usize = 16;

const CMD_IDENT: u8 = 0xA0;
const CMD_COUNT: u8 = 0xA1;
const CMD_DIVE: u8 = 0xA2;
const CMD_CLOCK: u8 = 0xB0;
const CMD_BYE: u8 = 0xAF;

/* Payload bytes per data packet. */
const SZ_DATA: usize = 64;

/* BLE GATT quantum: writes are chunked and reads staged at this size. */
const BLE_PACKET_SIZE: usize = 20;

const EXCHANGE_RETRIES: u32 = 3;

pub(crate) const FINGERPRINT_SIZE: usize = 8;

/* Offset of the fingerprint (start datetime + dive time) in a dive. */
const FP_OFFSET: usize = 2;

pub(crate) struct Screen {
    base: DeviceBase,
    ble: bool,
    ident: Ident,
}

#[derive(Debug, Clone, Copy)]
struct Ident {
    model: u8,
    firmware: u16,
    serial: u32,
}

/* Wrap `cmd` + `payload` in the wire envelope for the given variant. */
fn encode_message(cmd: u8, payload: &[u8], ble: bool) -> Vec<u8> {
    let len = (1 + payload.len()) as u8;

    let mut body = Vec::with_capacity(2 + payload.len());
    body.push(len);
    body.push(cmd);
    body.extend_from_slice(payload);

    if ble {
        return body;
    }

    let mut message = vec![HEADER; 3];
    let crc = crc16_ccitt(&body, 0x0000);
    message.extend_from_slice(&body);
    message.extend_from_slice(&crc.to_le_bytes());
    message.push(TRAILER);
    message
}

impl Screen {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        let ble = stream.transport() == Transport::Ble;
        if stream.transport() == Transport::Serial {
            stream.configure(&SerialParams::new(115_200))?;
        }
        stream.set_timeout(Timeout::from_ms(if ble { 5000 } else { 2000 }))?;
        stream.purge(Direction::All)?;

        let stream: Box<dyn IoStream> = if ble {
            Box::new(PacketStream::new(stream, BLE_PACKET_SIZE, BLE_PACKET_SIZE))
        } else {
            stream
        };
        let mut base = DeviceBase::new(Arc::clone(context), stream);

        let reply = Self::transfer(&mut base, ble, CMD_IDENT, &[], 7)?;
        let ident = Ident {
            model: reply[0],
            firmware: u16::from_le_bytes([reply[1], reply[2]]),
            serial: u32::from_le_bytes([reply[3], reply[4], reply[5], reply[6]]),
        };
        debug!(
            "identified model {:#04x}, firmware {}",
            ident.model, ident.firmware
        );

        Ok(Self { base, ble, ident })
    }

    /* One command round trip: send the envelope and decode the response,  */
    /* which mirrors the request's framing and command byte.               */
    fn transfer(
        base: &mut DeviceBase,
        ble: bool,
        cmd: u8,
        payload: &[u8],
        reply_len: usize,
    ) -> Result<Vec<u8>> {
        let message = encode_message(cmd, payload, ble);

        with_retries(base, EXCHANGE_RETRIES, |base| {
            write_all(&mut *base.stream, &message)?;
            Self::read_response(base, ble, cmd, reply_len)
        })
    }

    fn read_response(
        base: &mut DeviceBase,
        ble: bool,
        cmd: u8,
        reply_len: usize,
    ) -> Result<Vec<u8>> {
        if !ble {
            let mut header = [0u8; 3];
            read_exact(&mut *base.stream, &mut header)?;
            if header != [HEADER; 3] {
                return Err(Error::Protocol("response header mismatch"));
            }
        }

        let mut body = vec![0u8; 2 + reply_len];
        read_exact(&mut *base.stream, &mut body)?;
        if body[0] as usize != 1 + reply_len {
            return Err(Error::Protocol("response length mismatch"));
        }
        if body[1] != cmd {
            return Err(Error::Protocol("response command mismatch"));
        }

        if !ble {
            let mut tail = [0u8; 3];
            read_exact(&mut *base.stream, &mut tail)?;
            let received = u16::from_le_bytes([tail[0], tail[1]]);
            if crc16_ccitt(&body, 0x0000) != received {
                return Err(Error::Protocol("response checksum mismatch"));
            }
            if tail[2] != TRAILER {
                return Err(Error::Protocol("response trailer mismatch"));
            }
        }

        Ok(body[2..].to_vec())
    }

    /* Download one dive as a stream of fixed-size data packets. The first */
    /* packet's leading two bytes carry the total dive size.               */
    fn download_dive(&mut self, index: u16, progress: &mut Progress) -> Result<Vec<u8>> {
        let ble = self.ble;
        let mut delivered = 0u32;

        with_retries(&mut self.base, EXCHANGE_RETRIES, |base| {
            write_all(&mut *base.stream, &encode_message(CMD_DIVE, &index.to_le_bytes(), ble))?;
            Self::read_response(base, ble, CMD_DIVE, 0)?;

            let mut dive: Vec<u8> = Vec::new();
            let mut total: Option<usize> = None;

            loop {
                let mut data = [0u8; SZ_DATA];
                read_exact(&mut *base.stream, &mut data)?;

                if !ble {
                    let mut crc = [0u8; 2];
                    read_exact(&mut *base.stream, &mut crc)?;
                    if crc16_ccitt(&data, 0x0000) != u16::from_le_bytes(crc) {
                        return Err(Error::Protocol("data packet checksum mismatch"));
                    }
                }
                write_all(&mut *base.stream, &[ACK])?;

                let (payload, size) = match total {
                    None => {
                        let size = u16::from_le_bytes([data[0], data[1]]) as usize;
                        total = Some(size);
                        dive.reserve(size);
                        (&data[2..], size)
                    }
                    Some(size) => (&data[..], size),
                };

                let want = size - dive.len();
                dive.extend_from_slice(&payload[..want.min(payload.len())]);

                /* Scale this dive's contribution within its NSTEPS slot. */
                let target = (NSTEPS as usize * dive.len() / size.max(1)) as u32;
                if target > delivered {
                    progress.advance(base, target - delivered);
                    delivered = target;
                }

                if dive.len() >= size {
                    break;
                }
            }

            if ble {
                let mut eot = [0u8; EOT_BLOB_SIZE];
                read_exact(&mut *base.stream, &mut eot)?;
                if eot != [EOT; EOT_BLOB_SIZE] {
                    return Err(Error::Protocol("missing end-of-transmission blob"));
                }
            } else {
                let mut end = [0u8; 1];
                read_exact(&mut *base.stream, &mut end)?;
                if end[0] != END {
                    return Err(Error::Protocol("missing end marker"));
                }
            }

            Ok(dive)
        })
    }
}

impl FamilyDriver for Screen {
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

        let ble = self.ble;
        let reply = Self::transfer(&mut self.base, ble, CMD_COUNT, &[], 2)?;
        let count = u16::from_le_bytes([reply[0], reply[1]]);
        debug!("device holds {count} dives");

        let mut progress = Progress::new(&mut self.base, (count as u32 + 1) * NSTEPS);
        progress.advance(&mut self.base, NSTEPS);

        for index in 0..count {
            self.base.check_cancel()?;

            let dive = self.download_dive(index, &mut progress)?;
            if dive.len() < FP_OFFSET + FINGERPRINT_SIZE {
                return Err(Error::DataFormat("dive shorter than its fingerprint"));
            }

            let fp = &dive[FP_OFFSET..FP_OFFSET + FINGERPRINT_SIZE];
            if self.base.fingerprint_matches(fp) {
                break;
            }
            if !callback(&dive, fp) {
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
        let ble = self.ble;
        Self::transfer(&mut self.base, ble, CMD_CLOCK, &payload, 0)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let ble = self.ble;
        /* Goodbye is best effort; a sleeping device must not block close. */
        if let Err(err) = Self::transfer(&mut self.base, ble, CMD_BYE, &[], 0) {
            debug!("goodbye command failed: {err}");
        }
        self.base.stream.close()
    }
}
