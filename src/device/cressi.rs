/// Cressi Leonardo family driver.
///
/// Covers the Leonardo, Giotto and Newton: one command pulls the whole
/// memory image, and dives are recovered host-side from a circular profile
/// region with trailing-length blocks. Freedive sessions keep only their
/// logbook header in the ring; the newest session's samples are spliced in
/// from a separate scratch region.
use std::sync::Arc;

use tracing::debug;

use crate::buffer::Buffer;
use crate::checksum::crc16_arc;
use crate::context::Context;
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

const CMD_DUMP: u8 = 0xE8;
const ACK: u8 = 0x5A;

const MEMORY_SIZE: usize = 0x8000;

/* Download happens in slices so progress stays responsive. */
const CHUNK_SIZE: usize = 1024;

const EXCHANGE_RETRIES: u32 = 2;

pub(crate) const HEADER_SIZE: usize = 32;
pub(crate) const SAMPLE_SIZE: usize = 2;
pub(crate) const FINGERPRINT_SIZE: usize = 6;

/* Dive-mode byte of a freedive session header. */
pub(crate) const MODE_FREEDIVE: u8 = 3;

/* Memory map: identification block in front, end-of-profile pointer at   */
/* 0x20, freedive scratch region, then the circular profile ring.         */
const ID_MODEL: usize = 0x00;
const ID_FIRMWARE: usize = 0x01;
const ID_SERIAL: usize = 0x02;
const EOP_OFFSET: usize = 0x20;
const FREEDIVE_BEGIN: usize = 0x40;
const FREEDIVE_END: usize = 0x100;
const PROFILE_BEGIN: usize = 0x100;

fn layout(memory_size: usize) -> RingLayout {
    RingLayout {
        begin: PROFILE_BEGIN,
        end: memory_size,
        eop_offset: EOP_OFFSET,
        freedive_begin: FREEDIVE_BEGIN,
        freedive_end: FREEDIVE_END,
        header_size: HEADER_SIZE,
        sample_size: SAMPLE_SIZE,
        nsamples_offset: 8,
        freedive_mode: Some(MODE_FREEDIVE),
        fingerprint_offset: 2,
        fingerprint_size: FINGERPRINT_SIZE,
    }
}

pub(crate) struct Leonardo {
    base: DeviceBase,
    memory_size: usize,
}

impl Leonardo {
    pub(crate) fn open(context: &Arc<Context>, mut stream: Box<dyn IoStream>) -> Result<Self> {
        if stream.transport() == Transport::Serial {
            stream.configure(&SerialParams::new(115_200))?;
            stream.set_dtr(true)?;
            stream.set_rts(false)?;
        }
        stream.set_timeout(Timeout::from_ms(1500))?;
        stream.purge(Direction::All)?;
        stream.sleep(300);

        Ok(Self {
            base: DeviceBase::new(Arc::clone(context), stream),
            memory_size: MEMORY_SIZE,
        })
    }

    fn dump_memory(&mut self, buffer: &mut Buffer) -> Result<()> {
        let memory_size = self.memory_size;
        buffer.clear();
        buffer.resize(memory_size);

        let nchunks = memory_size.div_ceil(CHUNK_SIZE);
        let mut progress = Progress::new(&mut self.base, nchunks as u32);

        with_retries(&mut self.base, EXCHANGE_RETRIES, |base| {
            write_all(&mut *base.stream, &[CMD_DUMP])?;

            let mut ack = [0u8; 1];
            read_exact(&mut *base.stream, &mut ack)?;
            if ack[0] != ACK {
                return Err(Error::Protocol("dump command not acknowledged"));
            }
            Ok(())
        })?;

        for chunk in 0..nchunks {
            self.base.check_cancel()?;
            let offset = chunk * CHUNK_SIZE;
            let end = (offset + CHUNK_SIZE).min(memory_size);
            read_exact(&mut *self.base.stream, &mut buffer.data_mut()[offset..end])?;
            progress.advance(&mut self.base, 1);
        }

        let mut crc = [0u8; 2];
        read_exact(&mut *self.base.stream, &mut crc)?;
        if crc16_arc(buffer.data()) != u16::from_le_bytes(crc) {
            return Err(Error::Protocol("memory image checksum mismatch"));
        }

        self.base.emit(DeviceEvent::DevInfo {
            model: buffer[ID_MODEL] as u32,
            firmware: buffer[ID_FIRMWARE] as u32,
            serial: u32::from_le_bytes([
                buffer[ID_SERIAL],
                buffer[ID_SERIAL + 1],
                buffer[ID_SERIAL + 2],
                buffer[ID_SERIAL + 3],
            ]),
        });
        debug!("downloaded {memory_size} bytes of logbook memory");
        Ok(())
    }
}

impl FamilyDriver for Leonardo {
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

        let fingerprint = self.base.fingerprint.clone();
        ringbuffer::extract_dives(
            buffer.data(),
            &layout(self.memory_size),
            Some(&fingerprint),
            callback,
        )
    }
}
