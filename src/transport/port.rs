use std::io::ErrorKind;
use std::time::Duration;

use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};

use crate::config::PortProfile;
use crate::transport::SerialLink;
use crate::Result;

/// Short driver-level read timeout; data availability is polled by the
/// state machines, not awaited in the driver.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// The real serial port: 8N1 at the profiled rate, XON/XOFF off, flow
/// control initially disabled so RTS/CTS stay free for signaling.
#[derive(Debug)]
pub struct PortLink {
    port: SerialPort,
}

impl PortLink {
    pub fn open(profile: &PortProfile) -> Result<Self> {
        let baud = profile.baud;
        let mut port = SerialPort::open(&profile.path, move |mut settings: Settings| {
            settings.set_raw();
            settings.set_baud_rate(baud)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_stop_bits(StopBits::One);
            settings.set_parity(Parity::None);
            settings.set_flow_control(FlowControl::None);
            Ok(settings)
        })?;
        port.set_read_timeout(READ_TIMEOUT)?;
        Ok(Self { port })
    }
}

impl SerialLink for PortLink {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // Nothing buffered within the driver timeout
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(ref e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port.set_rts(level).map_err(Into::into)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port.set_dtr(level).map_err(Into::into)
    }

    fn cts(&mut self) -> Result<bool> {
        self.port.read_cts().map_err(Into::into)
    }

    fn dsr(&mut self) -> Result<bool> {
        self.port.read_dsr().map_err(Into::into)
    }

    fn set_bulk_flow(&mut self, enabled: bool) -> Result<()> {
        let mut settings = self.port.get_configuration()?;
        settings.set_flow_control(if enabled {
            FlowControl::RtsCts
        } else {
            FlowControl::None
        });
        self.port.set_configuration(&settings)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port.discard_input_buffer().map_err(Into::into)
    }
}
