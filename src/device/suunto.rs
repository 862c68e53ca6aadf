/// Suunto Vyper family driver.
///
/// Covers the classic serial Suunto models (Vyper, Cobra, Gekko) that share
/// the half-duplex RS-485 link: every transmitted byte is echoed back, the
/// whole 8 KiB memory is read in 32-byte pages protected by an XOR
/// checksum, and dives live in a circular profile region delimited by
/// end-of-dive markers.
use std::sync::Arc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::checksum::xor8;
use crate::context::Context;
use crate::device::{DeviceBase, DiveCallback, FamilyDriver, Progress, with_retries};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::iostream::{
    Direction, IoStream, Parity, SerialParams, Timeout, Transport, read_exact, write_all,
};
use crate::ringbuffer;

/* ------------------------------------------------------------------ */
/* Protocol constants                                                  */
/* ------------------------------------------------------------------ */

const CMD_READ: u8 = 0x05;

pub(crate) const PAGE_SIZE: usize = 32;
const MEMORY_SIZE: usize = 0x2000;

/* Memory map. */
const ID_MODEL: usize = 0x04;
const ID_FIRMWARE: usize = 0x05;
const ID_SERIAL: usize = 0x06;
const EOP_ADDRESS: usize = 0x51;
const PROFILE_BEGIN: usize = 0x71;

/* Profile region markers. */
pub(crate) const END_OF_DIVE: u8 = 0x80;

/* Dive header: year digit, month, day, hour, minute, interval, o2%,     */
/* max depth (be16 cm), dive time (be16 s), min temperature (i8 degC).   */
pub(crate) const HEADER_SIZE: usize = 13;

pub(crate) const FINGERPRINT_SIZE: usize = 5;

const EXCHANGE_RETRIES: u32 = 2;

/* Half-duplex turnaround between the echo drain and the next command. */
const INTERPACKET_DELAY_MS: u64 = 50;

pub(crate) struct SuuntoVyper {
    base: DeviceBase,
    memory_size: usize,
}

impl SuuntoVyper {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        if stream.transport() == Transport::Serial {
            let mut params = SerialParams::new(2400);
            params.parity = Parity::Odd;
            stream.configure(&params)?;
            /* The interface adapter is powered from the DTR line. */
            stream.set_dtr(true)?;
            stream.set_rts(false)?;
        }
        stream.set_timeout(Timeout::from_ms(2000))?;
        stream.purge(Direction::All)?;
        stream.sleep(100);

        Ok(Self {
            base: DeviceBase::new(Arc::clone(context), stream),
            memory_size: MEMORY_SIZE,
        })
    }

    /* One page exchange on the half-duplex link. The command and its     */
    /* checksum come straight back as an echo before the reply; any echo  */
    /* mismatch is fatal for the attempt.                                 */
    fn read_page(base: &mut DeviceBase, address: usize, out: &mut [u8]) -> Result<()> {
        let cmd = [
            CMD_READ,
            (address >> 8) as u8,
            address as u8,
            out.len() as u8,
        ];
        let crc = xor8(&cmd, 0);

        with_retries(base, EXCHANGE_RETRIES, |base| {
            base.stream.sleep(INTERPACKET_DELAY_MS);
            write_all(&mut *base.stream, &cmd)?;
            write_all(&mut *base.stream, &[crc])?;

            let mut echo = [0u8; 5];
            read_exact(&mut *base.stream, &mut echo)?;
            if echo[..4] != cmd || echo[4] != crc {
                return Err(Error::Protocol("command echo mismatch"));
            }

            let mut header = [0u8; 4];
            read_exact(&mut *base.stream, &mut header)?;
            if header != cmd {
                return Err(Error::Protocol("reply header mismatch"));
            }

            read_exact(&mut *base.stream, out)?;

            let mut received = [0u8; 1];
            read_exact(&mut *base.stream, &mut received)?;
            if received[0] != xor8(out, xor8(&header, 0)) {
                return Err(Error::Protocol("reply checksum mismatch"));
            }
            Ok(())
        })
    }

    fn dump_memory(&mut self, buffer: &mut Buffer) -> Result<()> {
        buffer.clear();
        buffer.resize(self.memory_size);

        let npages = self.memory_size / PAGE_SIZE;
        let mut progress = Progress::new(&mut self.base, npages as u32);

        for page in 0..npages {
            let address = page * PAGE_SIZE;
            Self::read_page(
                &mut self.base,
                address,
                &mut buffer.data_mut()[address..address + PAGE_SIZE],
            )?;
            progress.advance(&mut self.base, 1);
        }

        self.base.emit(DeviceEvent::DevInfo {
            model: buffer[ID_MODEL] as u32,
            firmware: buffer[ID_FIRMWARE] as u32,
            serial: u32::from_be_bytes([
                buffer[ID_SERIAL],
                buffer[ID_SERIAL + 1],
                buffer[ID_SERIAL + 2],
                buffer[ID_SERIAL + 3],
            ]),
        });
        Ok(())
    }
}

impl FamilyDriver for SuuntoVyper {
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

        let eop =
            u16::from_be_bytes([buffer[EOP_ADDRESS], buffer[EOP_ADDRESS + 1]]) as usize;

        let base = &mut self.base;
        ringbuffer::marker_extract(
            buffer.data(),
            PROFILE_BEGIN,
            self.memory_size,
            eop,
            END_OF_DIVE,
            &mut |chunk| {
                if chunk.len() < HEADER_SIZE {
                    debug!("skipping runt profile chunk ({} bytes)", chunk.len());
                    return true;
                }
                let fp = &chunk[..FINGERPRINT_SIZE];
                if base.fingerprint_matches(fp) {
                    return false;
                }
                callback(chunk, fp)
            },
        )
    }
}
