//! Serial/UART receiver channel

use crate::hardware::{CommError, CommResult, ReceiverChannel, ReceiverConfig};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// GNSS receiver attached to a serial port (8N1, no flow control)
pub struct SerialChannel {
    port_name: String,
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Open the configured port
    pub fn open(config: &ReceiverConfig) -> CommResult<Self> {
        config.validate()?;

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| CommError::PortUnavailable {
                port: config.port.clone(),
                details: e.to_string(),
            })?;

        tracing::info!(
            port = %config.port,
            baud_rate = config.baud_rate,
            "Opened receiver serial port"
        );

        Ok(Self {
            port_name: config.port.clone(),
            port,
        })
    }
}

impl ReceiverChannel for SerialChannel {
    fn read_bytes(&mut self, buf: &mut [u8]) -> CommResult<usize> {
        match self.port.read(buf) {
            Ok(0) => Err(CommError::ConnectionLost {
                channel: self.port_name.clone(),
            }),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(CommError::io("read", &e)),
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> CommResult<usize> {
        match self.port.write(data) {
            Ok(n) => Ok(n),
            // receiver not draining its input; the caller retries later
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(CommError::io("write", &e)),
        }
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = ReceiverConfig::new("", 115_200);
        assert!(matches!(
            SerialChannel::open(&config),
            Err(CommError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = ReceiverConfig::new("/dev/rtk-positioning-no-such-port", 115_200);
        assert!(matches!(
            SerialChannel::open(&config),
            Err(CommError::PortUnavailable { .. })
        ));
    }
}
