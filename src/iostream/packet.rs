/* Decorator for packet-quantized links (USB-HID, BLE GATT): outbound data
 * is split into packets of at most `osize` bytes, inbound data is staged
 * through a fixed-size read cache so short reads never lose packet bytes. */
use std::collections::VecDeque;

use crate::error::Result;
use crate::iostream::{Direction, IoStream, Lines, SerialParams, Timeout, Transport};

pub struct PacketStream {
    inner: Box<dyn IoStream>,
    isize_: usize,
    osize: usize,
    cache: VecDeque<u8>,
}

impl PacketStream {
    /* `isize_` is the inbound packet size (and read-cache capacity),     */
    /* `osize` the maximum outbound packet size.                          */
    pub fn new(inner: Box<dyn IoStream>, isize_: usize, osize: usize) -> Self {
        Self {
            inner,
            isize_,
            osize,
            cache: VecDeque::with_capacity(isize_),
        }
    }

    fn fill_cache(&mut self) -> Result<usize> {
        let mut packet = vec![0u8; self.isize_];
        let n = self.inner.read(&mut packet)?;
        self.cache.extend(&packet[..n]);
        Ok(n)
    }
}

impl IoStream for PacketStream {
    fn transport(&self) -> Transport {
        self.inner.transport()
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    fn timeout(&self) -> Timeout {
        self.inner.timeout()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cache.is_empty() {
            self.fill_cache()?;
        }

        let mut n = 0;
        while n < buf.len() {
            match self.cache.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        for chunk in buf.chunks(self.osize) {
            written += self.inner.write(chunk)?;
        }
        Ok(written)
    }

    fn configure(&mut self, params: &SerialParams) -> Result<()> {
        self.inner.configure(params)
    }

    fn set_break(&mut self, on: bool) -> Result<()> {
        self.inner.set_break(on)
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

    /* The staged cache counts as available before the device does. */
    fn get_available(&mut self) -> Result<usize> {
        if !self.cache.is_empty() {
            return Ok(self.cache.len());
        }
        self.inner.get_available()
    }

    fn ioctl(&mut self, request: u32, data: &mut [u8]) -> Result<usize> {
        self.inner.ioctl(request, data)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        if matches!(direction, Direction::Input | Direction::All) {
            self.cache.clear();
        }
        self.inner.purge(direction)
    }

    fn sleep(&mut self, ms: u64) {
        self.inner.sleep(ms);
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::memory::{Exchange, MemoryStream};

    #[test]
    fn inbound_cache_preserves_packet_tail() {
        let inner = MemoryStream::new(vec![Exchange::push(&[1, 2, 3, 4, 5, 6, 7, 8])]);
        let mut stream = PacketStream::new(Box::new(inner), 8, 8);

        /* A 3-byte read stages the full 8-byte packet; the tail stays    */
        /* readable from the cache.                                       */
        let mut head = [0u8; 3];
        assert_eq!(stream.read(&mut head).unwrap(), 3);
        assert_eq!(head, [1, 2, 3]);
        assert_eq!(stream.get_available().unwrap(), 5);

        let mut tail = [0u8; 5];
        assert_eq!(stream.read(&mut tail).unwrap(), 5);
        assert_eq!(tail, [4, 5, 6, 7, 8]);
    }

    #[test]
    fn outbound_writes_are_split() {
        let inner = MemoryStream::new(vec![
            Exchange::call(&[1, 2, 3, 4], &[]),
            Exchange::call(&[5, 6], &[]),
        ]);
        let mut stream = PacketStream::new(Box::new(inner), 8, 4);

        /* Six bytes with osize 4: the double sees a 4-byte then a 2-byte */
        /* packet, matching the two scripted calls.                       */
        assert_eq!(stream.write(&[1, 2, 3, 4, 5, 6]).unwrap(), 6);
    }

    #[test]
    fn purge_input_empties_cache() {
        let inner = MemoryStream::new(vec![Exchange::push(&[9, 9, 9, 9])]);
        let mut stream = PacketStream::new(Box::new(inner), 4, 4);

        let mut one = [0u8; 1];
        stream.read(&mut one).unwrap();
        stream.purge(Direction::Input).unwrap();
        assert_eq!(stream.get_available().unwrap(), 0);
    }
}
