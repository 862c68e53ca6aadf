/// ReefNet Sensus Ultra driver.
///
/// The recorder announces itself on power-up with a CRC-protected handshake
/// packet carrying its identity and clock. A single opcode then streams the
/// whole memory as fixed 512-byte pages, each prefixed with its page number
/// and protected by a CRC; the host accepts or rejects every page with a
/// one-byte ACK/NAK.
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::checksum::crc16_ccitt;
use crate::context::Context;
use crate::datetime::DateTime;
use crate::device::{DeviceBase, DiveCallback, FamilyDriver, Progress, with_retries};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::iostream::{
    Direction, IoStream, SerialParams, Timeout, Transport, read_exact, write_all,
};
use crate::ringbuffer::{self, RingLayout};

/* ------------------------------------------------------------------ */
/* Protocol constants                                                  */
/* ------------------------------------------------------------------ */

const CMD_DUMP: u8 = 0x44;

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

const HANDSHAKE_SIZE: usize = 24;

pub(crate) const PAGE_DATA_SIZE: usize = 512;
const PAGE_PACKET_SIZE: usize = 2 + PAGE_DATA_SIZE + 2;

const NPAGES: usize = 64;

/* Rejected pages need a settle pause before the NAK prompt. */
const REJECT_DELAY_MS: u64 = 250;

const HANDSHAKE_RETRIES: u32 = 4;
const PAGE_RETRIES: u32 = 2;

pub(crate) const FINGERPRINT_SIZE: usize = 4;

/* Memory map: little-endian end-of-profile pointer in front, dive ring  */
/* behind it. Dive headers are 16 bytes: mode, reserved, sample count    */
/* (le16), device timestamp (le32, the fingerprint), sample interval    */
/* (le16), surface pressure (le16 mbar), reserved; samples are 4 bytes  */
/* of absolute pressure (le16 mbar) and temperature (le16 0.1 degC).    */
fn layout(memory_size: usize) -> RingLayout {
    RingLayout {
        begin: 4,
        end: memory_size,
        eop_offset: 0,
        freedive_begin: 0,
        freedive_end: 0,
        header_size: 16,
        sample_size: 4,
        nsamples_offset: 2,
        freedive_mode: None,
        fingerprint_offset: 4,
        fingerprint_size: FINGERPRINT_SIZE,
    }
}

/* Identification and clock recorded from the power-up handshake. */
#[derive(Debug, Clone)]
struct Handshake {
    model: u8,
    firmware: u8,
    serial: u32,
    devtime: u32,
    /* Raw payload, reemitted as a Vendor event for hosts that archive it. */
    raw: Vec<u8>,
}

pub(crate) struct SensusUltra {
    base: DeviceBase,
    handshake: Handshake,
    npages: usize,
}

impl SensusUltra {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        if stream.transport() == Transport::Serial {
            stream.configure(&SerialParams::new(115_200))?;
        }
        stream.set_timeout(Timeout::from_ms(3000))?;
        stream.purge(Direction::All)?;

        let mut base = DeviceBase::new(Arc::clone(context), stream);
        let handshake = Self::read_handshake(&mut base)?;
        debug!(
            "handshake: model {:#04x}, firmware {:#04x}, serial {}",
            handshake.model, handshake.firmware, handshake.serial
        );

        Ok(Self {
            base,
            handshake,
            npages: NPAGES,
        })
    }

    /* The device repeats the handshake until it is spoken to, so a       */
    /* corrupted read only costs waiting for the next repetition.         */
    fn read_handshake(base: &mut DeviceBase) -> Result<Handshake> {
        with_retries(base, HANDSHAKE_RETRIES, |base| {
            let mut packet = [0u8; HANDSHAKE_SIZE];
            read_exact(&mut *base.stream, &mut packet)?;

            let (payload, crc_bytes) = packet.split_at(HANDSHAKE_SIZE - 2);
            let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
            if crc16_ccitt(payload, 0x0000) != received {
                return Err(Error::Protocol("handshake checksum mismatch"));
            }

            Ok(Handshake {
                model: payload[0],
                firmware: payload[1],
                serial: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
                devtime: u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]),
                raw: payload.to_vec(),
            })
        })
    }

    fn announce(&mut self) {
        self.base.emit(DeviceEvent::DevInfo {
            model: self.handshake.model as u32,
            firmware: self.handshake.firmware as u32,
            serial: self.handshake.serial,
        });
        self.base.emit(DeviceEvent::Clock {
            systime: DateTime::now(),
            devtime: self.handshake.devtime,
        });
        self.base.emit(DeviceEvent::Vendor(self.handshake.raw.clone()));
    }

    /* Receive one page, prompting retransmission on a bad CRC or an      */
    /* unexpected page number.                                            */
    fn read_page(base: &mut DeviceBase, expected: usize, out: &mut [u8]) -> Result<()> {
        let mut rejects = 0;
        loop {
            base.check_cancel()?;

            let mut packet = [0u8; PAGE_PACKET_SIZE];
            read_exact(&mut *base.stream, &mut packet)?;

            let pagenum =
                u16::from_le_bytes([packet[0], packet[1]]) as usize;
            let received = u16::from_le_bytes([
                packet[PAGE_PACKET_SIZE - 2],
                packet[PAGE_PACKET_SIZE - 1],
            ]);
            let computed = crc16_ccitt(&packet[..PAGE_PACKET_SIZE - 2], 0x0000);

            if computed == received && pagenum == expected {
                out.copy_from_slice(&packet[2..2 + PAGE_DATA_SIZE]);
                write_all(&mut *base.stream, &[ACK])?;
                return Ok(());
            }

            rejects += 1;
            if rejects > PAGE_RETRIES {
                return Err(Error::Protocol("page rejected too many times"));
            }
            warn!("rejecting page {pagenum} (expected {expected}), attempt {rejects}");
            let _ = base.stream.purge(Direction::Input);
            base.stream.sleep(REJECT_DELAY_MS);
            write_all(&mut *base.stream, &[NAK])?;
        }
    }

    fn dump_memory(&mut self, buffer: &mut Buffer) -> Result<()> {
        let memory_size = self.npages * PAGE_DATA_SIZE;
        buffer.clear();
        buffer.resize(memory_size);

        self.announce();

        let mut progress = Progress::new(&mut self.base, self.npages as u32);

        self.base.check_cancel()?;
        write_all(&mut *self.base.stream, &[CMD_DUMP])?;

        for page in 0..self.npages {
            let offset = page * PAGE_DATA_SIZE;
            Self::read_page(
                &mut self.base,
                page,
                &mut buffer.data_mut()[offset..offset + PAGE_DATA_SIZE],
            )?;
            progress.advance(&mut self.base, 1);
        }
        Ok(())
    }
}

impl FamilyDriver for SensusUltra {
    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn fingerprint_size(&self) -> usize {
        FINGERPRINT_SIZE
    }

    fn dump(&mut self, buffer: &mut Buffer) -> Result<()> {
        self.dump_memory(buffer)
    }

    fn foreach(&mut self, callback: DiveCallback<'_>) -> Result<()> {
        let mut buffer = Buffer::new();
        self.dump_memory(&mut buffer)?;

        let memory_size = self.npages * PAGE_DATA_SIZE;
        let fingerprint = self.base.fingerprint.clone();
        ringbuffer::extract_dives(
            buffer.data(),
            &layout(memory_size),
            Some(&fingerprint),
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::memory::{Exchange, MemoryStream};

    fn handshake_packet(model: u8, firmware: u8, serial: u32, devtime: u32) -> Vec<u8> {
        let mut payload = vec![0u8; HANDSHAKE_SIZE - 2];
        payload[0] = model;
        payload[1] = firmware;
        payload[2..6].copy_from_slice(&serial.to_le_bytes());
        payload[6..10].copy_from_slice(&devtime.to_le_bytes());

        let crc = crc16_ccitt(&payload, 0x0000);
        payload.extend_from_slice(&crc.to_le_bytes());
        payload
    }

    fn page_packet(pagenum: u16, data: &[u8]) -> Vec<u8> {
        assert_eq!(data.len(), PAGE_DATA_SIZE);
        let mut packet = pagenum.to_le_bytes().to_vec();
        packet.extend_from_slice(data);
        let crc = crc16_ccitt(&packet, 0x0000);
        packet.extend_from_slice(&crc.to_le_bytes());
        packet
    }

    /* One dive block in the trailing-length ring format. */
    fn dive_block(devtime: u32, samples: &[u8]) -> Vec<u8> {
        let mut block = vec![2u8, 0];
        block.extend_from_slice(&((samples.len() / 4) as u16).to_le_bytes());
        block.extend_from_slice(&devtime.to_le_bytes());
        block.extend_from_slice(&10u16.to_le_bytes()); /* interval */
        block.extend_from_slice(&1013u16.to_le_bytes()); /* surface */
        block.extend_from_slice(&[0, 0, 0, 0]); /* reserved */
        block.extend_from_slice(samples);
        let length = (block.len() + 2) as u16;
        block.extend_from_slice(&length.to_le_bytes());
        block
    }

    /* A single-page memory image holding two dives. */
    fn sample_memory() -> (Vec<u8>, Vec<Vec<u8>>) {
        let d1 = dive_block(1000, &[0x10, 0x27, 0x14, 0x01, 0x20, 0x27, 0x12, 0x01]);
        let d2 = dive_block(2000, &[0x30, 0x27, 0x10, 0x01]);

        let mut memory = vec![0xFFu8; PAGE_DATA_SIZE];
        let mut offset = 4;
        for block in [&d1, &d2] {
            memory[offset..offset + block.len()].copy_from_slice(block);
            offset += block.len();
        }
        memory[..2].copy_from_slice(&(offset as u16).to_le_bytes());
        (memory, vec![d1, d2])
    }

    fn open_device(script: Vec<Exchange>) -> SensusUltra {
        let context = Arc::new(Context::new());
        let stream = MemoryStream::new(script);
        SensusUltra::open(&context, Box::new(stream)).unwrap()
    }

    #[test]
    fn open_reads_handshake() {
        let device = open_device(vec![Exchange::push(&handshake_packet(3, 0x21, 7777, 99))]);
        assert_eq!(device.handshake.model, 3);
        assert_eq!(device.handshake.firmware, 0x21);
        assert_eq!(device.handshake.serial, 7777);
        assert_eq!(device.handshake.devtime, 99);
    }

    #[test]
    fn corrupted_handshake_retries_on_next_repetition() {
        let mut corrupt = handshake_packet(3, 0x21, 7777, 99);
        corrupt[0] ^= 0xFF;
        let device = open_device(vec![
            Exchange::push(&corrupt),
            Exchange::push(&handshake_packet(3, 0x21, 7777, 99)),
        ]);
        assert_eq!(device.handshake.serial, 7777);
    }

    #[test]
    fn dump_accepts_pages_and_recovers_from_bad_crc() {
        let (memory, _) = sample_memory();
        let good = page_packet(0, &memory);
        let mut corrupt = good.clone();
        corrupt[5] ^= 0x40;

        let script = vec![
            Exchange::push(&handshake_packet(1, 1, 1, 1)),
            /* Dump command answered with a corrupted page; the NAK        */
            /* prompts a clean retransmission.                             */
            Exchange::call(&[CMD_DUMP], &corrupt),
            Exchange::call(&[NAK], &good),
            Exchange::call(&[ACK], &[]),
        ];
        let mut device = open_device(script);
        device.npages = 1;

        let mut buffer = Buffer::new();
        device.dump_memory(&mut buffer).unwrap();
        assert_eq!(buffer.data(), &memory[..]);
    }

    #[test]
    fn foreach_delivers_newest_first() {
        let (memory, dives) = sample_memory();
        let script = vec![
            Exchange::push(&handshake_packet(1, 1, 1, 1)),
            Exchange::call(&[CMD_DUMP], &page_packet(0, &memory)),
            Exchange::call(&[ACK], &[]),
        ];
        let mut device = open_device(script);
        device.npages = 1;

        let mut seen = Vec::new();
        device
            .foreach(&mut |dive, fp| {
                seen.push((dive.to_vec(), fp.to_vec()));
                true
            })
            .unwrap();

        assert_eq!(seen.len(), 2);
        /* Blocks are delivered without their trailing length word. */
        assert_eq!(seen[0].0, dives[1][..dives[1].len() - 2].to_vec());
        assert_eq!(seen[0].1, 2000u32.to_le_bytes());
        assert_eq!(seen[1].1, 1000u32.to_le_bytes());
    }

    #[test]
    fn fingerprint_makes_second_download_empty() {
        let (memory, _) = sample_memory();

        let script = || {
            vec![
                Exchange::push(&handshake_packet(1, 1, 1, 1)),
                Exchange::call(&[CMD_DUMP], &page_packet(0, &memory)),
                Exchange::call(&[ACK], &[]),
            ]
        };

        let mut device = open_device(script());
        device.npages = 1;
        let mut newest_fp = Vec::new();
        device
            .foreach(&mut |_, fp| {
                if newest_fp.is_empty() {
                    newest_fp = fp.to_vec();
                }
                true
            })
            .unwrap();

        let mut device = open_device(script());
        device.npages = 1;
        device.base.fingerprint = newest_fp;

        let mut count = 0;
        device
            .foreach(&mut |_, _| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
