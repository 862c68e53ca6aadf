/* HDLC framing decorator: 0x7E-delimited, byte-stuffed frames protected by
 * the X-25 frame check sequence. One read yields one frame payload; frames
 * that fail the FCS or overflow the size limit are dropped. */
use tracing::warn;

use crate::checksum::crc16_x25;
use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStream, Lines, SerialParams, Timeout, Transport};

const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

pub struct HdlcStream {
    inner: Box<dyn IoStream>,
    /* Maximum payload size per direction. */
    imax: usize,
    omax: usize,
}

impl HdlcStream {
    pub fn new(inner: Box<dyn IoStream>, imax: usize, omax: usize) -> Self {
        Self { inner, imax, omax }
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte)? {
                0 => continue,
                _ => return Ok(byte[0]),
            }
        }
    }

    pub(crate) fn encode(payload: &[u8]) -> Vec<u8> {
        let fcs = crc16_x25(payload);
        let mut out = Vec::with_capacity(payload.len() + 6);
        out.push(FLAG);
        for &byte in payload.iter().chain(fcs.to_le_bytes().iter()) {
            if byte == FLAG || byte == ESCAPE {
                out.push(ESCAPE);
                out.push(byte ^ ESCAPE_XOR);
            } else {
                out.push(byte);
            }
        }
        out.push(FLAG);
        out
    }
}

impl IoStream for HdlcStream {
    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn timeout(&self) -> Timeout {
        self.inner.timeout()
    }

    /* Returns exactly one frame's payload. Bytes outside a frame and     */
    /* frames with a bad FCS are discarded, not surfaced.                 */
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            /* Hunt for an opening flag; inter-frame noise is dropped. */
            while self.read_byte()? != FLAG {}

            let mut frame = Vec::with_capacity(self.imax + 2);
            let mut oversize = false;
            loop {
                let mut byte = self.read_byte()?;
                if byte == FLAG {
                    break;
                }
                if byte == ESCAPE {
                    byte = self.read_byte()? ^ ESCAPE_XOR;
                }
                if frame.len() >= self.imax + 2 {
                    oversize = true;
                    continue;
                }
                frame.push(byte);
            }

            /* Back-to-back flags delimit an empty frame; keep hunting. */
            if frame.is_empty() {
                continue;
            }
            if oversize || frame.len() < 3 {
                warn!("dropping malformed HDLC frame ({} bytes)", frame.len());
                continue;
            }

            let (payload, fcs_bytes) = frame.split_at(frame.len() - 2);
            let fcs = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);
            if crc16_x25(payload) != fcs {
                warn!(
                    "dropping HDLC frame with bad FCS: computed {:#06x}, received {:#06x}",
                    crc16_x25(payload),
                    fcs
                );
                continue;
            }

            if payload.len() > buf.len() {
                return Err(Error::InvalidArgs("read buffer smaller than frame"));
            }
            buf[..payload.len()].copy_from_slice(payload);
            return Ok(payload.len());
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.len() > self.omax {
            return Err(Error::InvalidArgs("frame exceeds outbound limit"));
        }
        let encoded = Self::encode(buf);
        crate::iostream::write_all(&mut *self.inner, &encoded)?;
        Ok(buf.len())
    }

    fn configure(&mut self, params: &SerialParams) -> Result<()> {
        self.inner.configure(params)
    }

    fn set_dtr(&mut self, on: bool) -> Result<()> {
        self.inner.set_dtr(on)
    }

    fn set_rts(&mut self, on: bool) -> Result<()> {
        self.inner.set_rts(on)
    }

    fn get_lines(&mut self) -> Result<Lines> {
        self.inner.get_lines()
    }

    fn get_available(&mut self) -> Result<usize> {
        self.inner.get_available()
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        self.inner.purge(direction)
    }

    fn sleep(&mut self, ms: u64) {
        self.inner.sleep(ms);
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}
