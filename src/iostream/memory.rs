/* Scripted in-memory stream used by the driver tests: a queue of expected
 * command/reply exchanges stands in for the device end of the link. */
use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::iostream::{Direction, IoStream, Timeout, Transport};

/* One step of a device conversation. */
#[derive(Debug, Clone)]
pub enum Exchange {
    /* Expect exactly these bytes written (possibly across several write  */
    /* calls), then make the reply readable.                              */
    Call { expect: Vec<u8>, reply: Vec<u8> },
    /* Device-initiated bytes readable without a preceding command.       */
    Push(Vec<u8>),
    /* The next read attempt times out once. */
    Stall,
}

impl Exchange {
    pub fn call(expect: &[u8], reply: &[u8]) -> Self {
        Exchange::Call {
            expect: expect.to_vec(),
            reply: reply.to_vec(),
        }
    }

    pub fn push(data: &[u8]) -> Self {
        Exchange::Push(data.to_vec())
    }
}

pub struct MemoryStream {
    transport: Transport,
    timeout: Timeout,
    script: VecDeque<Exchange>,
    /* Progress into the expected bytes of the front `Call`. */
    matched: usize,
    rx: VecDeque<u8>,
    /* Half-duplex links echo every transmitted byte back to the sender. */
    echo: bool,
}

impl MemoryStream {
    pub fn new(script: Vec<Exchange>) -> Self {
        Self {
            transport: Transport::Custom,
            timeout: Timeout::Bounded(std::time::Duration::from_secs(1)),
            script: script.into(),
            matched: 0,
            rx: VecDeque::new(),
            echo: false,
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /* True once every scripted exchange has been consumed. */
    pub fn exhausted(&self) -> bool {
        self.script.is_empty() && self.rx.is_empty()
    }

    fn promote_pushes(&mut self) {
        while let Some(Exchange::Push(_)) = self.script.front() {
            if let Some(Exchange::Push(data)) = self.script.pop_front() {
                self.rx.extend(data);
            }
        }
    }
}

impl IoStream for MemoryStream {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rx.is_empty() {
            self.promote_pushes();
        }
        if self.rx.is_empty() {
            if let Some(Exchange::Stall) = self.script.front() {
                self.script.pop_front();
            }
            return Err(Error::Timeout);
        }

        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
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
        if self.echo {
            self.rx.extend(buf.iter().copied());
        }

        let mut offset = 0;
        while offset < buf.len() {
            self.promote_pushes();
            let (expect, reply) = match self.script.front() {
                Some(Exchange::Call { expect, reply }) => (expect.clone(), reply.clone()),
                Some(Exchange::Stall) => {
                    /* A stall only swallows reads; writes pass through it. */
                    break;
                }
                Some(Exchange::Push(_)) => unreachable!("promote_pushes already drained pushes"),
                None => break,
            };

            let remaining = &expect[self.matched..];
            let chunk = &buf[offset..];
            let take = remaining.len().min(chunk.len());
            if chunk[..take] != remaining[..take] {
                return Err(Error::Protocol("unexpected command bytes"));
            }
            self.matched += take;
            offset += take;

            if self.matched == expect.len() {
                self.rx.extend(reply);
                self.script.pop_front();
                self.matched = 0;
            }
        }
        Ok(buf.len())
    }

    fn get_available(&mut self) -> Result<usize> {
        self.promote_pushes();
        Ok(self.rx.len())
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        if matches!(direction, Direction::Input | Direction::All) {
            self.rx.clear();
        }
        Ok(())
    }

    fn sleep(&mut self, _ms: u64) {
        /* Scripted time: nothing to wait for. */
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iostream::read_exact;

    #[test]
    fn call_reply_roundtrip() {
        let mut stream = MemoryStream::new(vec![Exchange::call(&[0x01, 0x02], &[0xAA, 0xBB])]);

        stream.write(&[0x01]).unwrap();
        stream.write(&[0x02]).unwrap();

        let mut buf = [0u8; 2];
        read_exact(&mut stream, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
        assert!(stream.exhausted());
    }

    #[test]
    fn unexpected_write_is_protocol_error() {
        let mut stream = MemoryStream::new(vec![Exchange::call(&[0x01], &[])]);
        assert!(matches!(
            stream.write(&[0x7F]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn push_is_readable_without_command() {
        let mut stream = MemoryStream::new(vec![Exchange::push(&[0x10, 0x20])]);
        assert_eq!(stream.get_available().unwrap(), 2);

        let mut buf = [0u8; 2];
        read_exact(&mut stream, &mut buf).unwrap();
        assert_eq!(buf, [0x10, 0x20]);
    }

    #[test]
    fn stall_times_out_once() {
        let mut stream = MemoryStream::new(vec![
            Exchange::Stall,
            Exchange::push(&[0x42]),
        ]);

        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf), Err(Error::Timeout)));
        assert_eq!(stream.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn echo_mode_mirrors_writes() {
        let mut stream =
            MemoryStream::new(vec![Exchange::call(&[0x05, 0x06], &[0x99])]).with_echo();

        stream.write(&[0x05, 0x06]).unwrap();

        let mut buf = [0u8; 3];
        read_exact(&mut stream, &mut buf).unwrap();
        assert_eq!(buf, [0x05, 0x06, 0x99]);
    }

    #[test]
    fn purge_drops_pending_input() {
        let mut stream = MemoryStream::new(vec![Exchange::push(&[1, 2, 3])]);
        assert_eq!(stream.get_available().unwrap(), 3);
        stream.purge(Direction::Input).unwrap();
        assert_eq!(stream.get_available().unwrap(), 0);
    }
}
