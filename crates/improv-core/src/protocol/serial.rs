//! Serial port handling
//!
//! Opens a serial port as a [`Transport`]. Improv firmware listens at
//! 115200 baud, 8N1, without flow control.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use super::{ProtocolError, Transport, DEFAULT_BAUD_RATE};

fn serial_error(err: serialport::Error) -> ProtocolError {
    ProtocolError::SerialError(err.to_string())
}

/// Open `name` for an Improv session
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Transport, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    debug!(port = name, baud, "opening serial port");

    let mut port = tokio_serial::new(name, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(serial_error)?;

    configure_port(&mut port)?;
    Ok(Transport::from_stream(port))
}

/// Assert DTR so boards that reset on a DTR edge stay out of the bootloader.
pub fn configure_port(port: &mut SerialStream) -> Result<(), ProtocolError> {
    if let Err(err) = port.write_data_terminal_ready(true) {
        // Some USB bridges do not expose DTR
        warn!(%err, "failed to assert DTR, continuing");
    }
    port.clear(serialport::ClearBuffer::All)
        .map_err(serial_error)
}
