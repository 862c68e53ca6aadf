/* Serial transport backend on top of the `serialport` crate. */
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, SerialPort};
use tracing::debug;

use crate::error::{Error, Result};
use crate::iostream::{
    Direction, FlowControl, IoStream, Lines, Parity, SerialParams, StopBits, Timeout, Transport,
};

/* Stand-in for a blocking open: the OS has no unbounded serial read, so  */
/* `Timeout::Blocking` maps to a deadline long past any download.         */
const BLOCKING_SENTINEL: Duration = Duration::from_secs(86_400);

pub struct SerialStream {
    port: Box<dyn SerialPort>,
    timeout: Timeout,
}

impl SerialStream {
    /* Open the serial device node at `path`. The port starts at 9600 8N1 */
    /* with a one second timeout; drivers reconfigure during open().      */
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, 9600)
            .timeout(Duration::from_secs(1))
            .open()?;
        debug!("opened serial port {path}");

        Ok(Self {
            port,
            timeout: Timeout::Bounded(Duration::from_secs(1)),
        })
    }
}

impl IoStream for SerialStream {
    fn transport(&self) -> Transport {
        Transport::Serial
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        let dur = match timeout {
            Timeout::Blocking => BLOCKING_SENTINEL,
            Timeout::Immediate => Duration::ZERO,
            Timeout::Bounded(d) => d,
        };
        self.port.set_timeout(dur)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn configure(&mut self, params: &SerialParams) -> Result<()> {
        let databits = match params.databits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            _ => return Err(Error::InvalidArgs("databits out of range")),
        };
        let parity = match params.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            /* Mark/space parity has no host-side support. */
            Parity::Mark | Parity::Space => return Err(Error::Unsupported),
        };
        let stopbits = match params.stopbits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OneAndHalf => return Err(Error::Unsupported),
        };
        let flowcontrol = match params.flowcontrol {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        };

        self.port.set_baud_rate(params.baudrate)?;
        self.port.set_data_bits(databits)?;
        self.port.set_parity(parity)?;
        self.port.set_stop_bits(stopbits)?;
        self.port.set_flow_control(flowcontrol)?;
        debug!(
            "serial configured: {} baud, {} databits",
            params.baudrate, params.databits
        );
        Ok(())
    }

    fn set_break(&mut self, on: bool) -> Result<()> {
        if on {
            self.port.set_break()?;
        } else {
            self.port.clear_break()?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, on: bool) -> Result<()> {
        self.port.write_data_terminal_ready(on)?;
        Ok(())
    }

    fn set_rts(&mut self, on: bool) -> Result<()> {
        self.port.write_request_to_send(on)?;
        Ok(())
    }

    fn get_lines(&mut self) -> Result<Lines> {
        Ok(Lines {
            dcd: self.port.read_carrier_detect()?,
            cts: self.port.read_clear_to_send()?,
            dsr: self.port.read_data_set_ready()?,
            rng: self.port.read_ring_indicator()?,
        })
    }

    fn get_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = std::io::Read::read(&mut self.port, buf).map_err(Error::from)?;
        debug!("RX {} bytes: {:02x?}", n, &buf[..n]);
        Ok(n)
    }

    /* Drains to the wire before returning, like `tcdrain`. */
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = std::io::Write::write(&mut self.port, buf).map_err(Error::from)?;
        std::io::Write::flush(&mut self.port).map_err(Error::from)?;
        debug!("TX {} bytes: {:02x?}", n, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut self.port).map_err(Error::from)
    }

    fn purge(&mut self, direction: Direction) -> Result<()> {
        let target = match direction {
            Direction::Input => ClearBuffer::Input,
            Direction::Output => ClearBuffer::Output,
            Direction::All => ClearBuffer::All,
        };
        self.port.clear(target)?;
        Ok(())
    }
}
