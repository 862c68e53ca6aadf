/* Byte-stream framework: the IoStream trait all transports implement, the
 * transport/timeout/serial-parameter model, and the framing decorators
 * (fixed-packet splitter, HDLC framer) shared by the device drivers. */
pub mod hdlc;
pub mod memory;
pub mod packet;
pub mod serial;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/* Link type a stream (or a descriptor) speaks. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Serial,
    Usb,
    UsbHid,
    Irda,
    Bluetooth,
    Ble,
    /* Host-provided stream outside the built-in backends. */
    Custom,
}

impl Transport {
    const fn bit(self) -> u8 {
        match self {
            Transport::Serial => 1 << 0,
            Transport::Usb => 1 << 1,
            Transport::UsbHid => 1 << 2,
            Transport::Irda => 1 << 3,
            Transport::Bluetooth => 1 << 4,
            Transport::Ble => 1 << 5,
            Transport::Custom => 1 << 6,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Serial => "serial",
            Transport::Usb => "usb",
            Transport::UsbHid => "usbhid",
            Transport::Irda => "irda",
            Transport::Bluetooth => "bluetooth",
            Transport::Ble => "ble",
            Transport::Custom => "custom",
        };
        f.write_str(s)
    }
}

/* Set of transports a device family is reachable over. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMask(u8);

impl TransportMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(transports: &[Transport]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < transports.len() {
            bits |= transports[i].bit();
            i += 1;
        }
        Self(bits)
    }

    pub const fn contains(self, transport: Transport) -> bool {
        self.0 & transport.bit() != 0
    }
}

/* Read/write deadline. `Blocking` waits forever, `Immediate` never waits, */
/* `Bounded` waits up to the given duration.                               */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Blocking,
    Immediate,
    Bounded(Duration),
}

impl Timeout {
    pub fn from_ms(ms: i32) -> Self {
        match ms {
            i32::MIN..=-1 => Timeout::Blocking,
            0 => Timeout::Immediate,
            _ => Timeout::Bounded(Duration::from_millis(ms as u64)),
        }
    }

    /* Absolute deadline for a multi-read sequence entered now. */
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Bounded(d) => Some(Instant::now() + d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OneAndHalf,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

/* Serial line parameters. `databits` must be 5-8. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baudrate: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: StopBits,
    pub flowcontrol: FlowControl,
}

impl SerialParams {
    pub const fn new(baudrate: u32) -> Self {
        Self {
            baudrate,
            databits: 8,
            parity: Parity::None,
            stopbits: StopBits::One,
            flowcontrol: FlowControl::None,
        }
    }
}

/* Modem line state bitset. */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lines {
    pub dcd: bool,
    pub cts: bool,
    pub dsr: bool,
    pub rng: bool,
}

/* Purge direction. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    All,
}

/* A uniform capability set over serial/BT/USB-HID/BLE links.             */
/*                                                                        */
/* Operations a transport cannot express return `Unsupported` from the    */
/* default methods; backends override what they can actually do. All I/O  */
/* honors the stream's current timeout, and `read` may return fewer bytes */
/* than requested without that being an error.                            */
pub trait IoStream: Send {
    fn transport(&self) -> Transport;

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()>;

    fn timeout(&self) -> Timeout;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn configure(&mut self, _params: &SerialParams) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_break(&mut self, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_dtr(&mut self, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn set_rts(&mut self, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn get_lines(&mut self) -> Result<Lines> {
        Err(Error::Unsupported)
    }

    fn get_available(&mut self) -> Result<usize> {
        Err(Error::Unsupported)
    }

    /* Success iff data is pending within `timeout`; `Timeout` otherwise. */
    fn poll(&mut self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.deadline();
        loop {
            if self.get_available()? > 0 {
                return Ok(());
            }
            match (timeout, deadline) {
                (Timeout::Immediate, _) => return Err(Error::Timeout),
                (_, Some(d)) if Instant::now() >= d => return Err(Error::Timeout),
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    /* Escape hatch for transport-specific requests (BLE characteristic   */
    /* access, USB control transfers, serial latency knobs).              */
    fn ioctl(&mut self, _request: u32, _data: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn purge(&mut self, _direction: Direction) -> Result<()> {
        Ok(())
    }

    fn sleep(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    /* Idempotent release of the underlying OS resource. */
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/* Fill `buf` completely, looping over partial reads against one absolute */
/* deadline captured on entry. Intermediate short reads keep the clock;   */
/* only an exhausted deadline (or a stalled non-erroring stream) times    */
/* out. */
pub fn read_exact(stream: &mut dyn IoStream, buf: &mut [u8]) -> Result<()> {
    let deadline = stream.timeout().deadline();
    let mut filled = 0;

    while filled < buf.len() {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(Error::Timeout);
            }
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::Timeout),
            Ok(n) => filled += n,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/* Write all of `buf`, looping over partial transfers. */
pub fn write_all(stream: &mut dyn IoStream, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(Error::Io(std::io::Error::other("write stalled"))),
            Ok(n) => written += n,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
