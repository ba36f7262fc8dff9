use crate::config::SerialConfig;
use crate::policy::Command;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;

/// Most inbound diagnostic bytes held between polls.
const MAX_LINE_LEN: usize = 1024;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("Failed to send {0} command: {1}")]
    Write(Command, io::Error),
    #[error("Serial link is closed")]
    Closed,
}

#[derive(Error, Debug)]
enum DecodeError {
    #[error("Diagnostic line is not valid UTF-8: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),
    #[error("Diagnostic line exceeded {0} bytes")]
    Overlong(usize),
    #[error("Failed to read diagnostics: {0}")]
    Read(#[from] io::Error),
}

/// Byte stream to the motor controller.
pub trait Transport: Read + Write {
    /// Number of inbound bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

impl Transport for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }
}

/// Serial connection to the motor controller board.
///
/// Dropping an open link sends a final `Stop` before releasing the port.
pub struct MotorLink<T: Transport> {
    port: Option<T>,
    name: String,
    inbound: Vec<u8>,
    stop_settle: Duration,
}

impl MotorLink<Box<dyn SerialPort>> {
    pub fn open(config: &SerialConfig) -> Result<Self, LinkError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.get_timeout())
            .open()
            .map_err(|source| LinkError::Open {
                port: config.port.clone(),
                source,
            })?;

        tracing::info!(
            "Opened serial link {} at {} baud, waiting {:?} for controller reset",
            config.port,
            config.baud_rate,
            config.get_reset_delay()
        );
        // Blocks the calling thread; only ever runs once during startup
        std::thread::sleep(config.get_reset_delay());

        Ok(Self::from_transport(
            port,
            &config.port,
            config.get_stop_settle(),
        ))
    }
}

impl<T: Transport> MotorLink<T> {
    pub fn from_transport(port: T, name: &str, stop_settle: Duration) -> Self {
        Self {
            port: Some(port),
            name: name.to_string(),
            inbound: Vec::new(),
            stop_settle,
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Writes the command's byte once; a failed write is never retried.
    pub fn send(&mut self, command: Command) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::Closed)?;
        write_command(port, command)?;
        tracing::debug!("Sent {} command", command);
        Ok(())
    }

    /// Returns one complete diagnostic line if the controller has sent one.
    ///
    /// Never fails: unreadable or undecodable input is dropped.
    pub fn poll_diagnostics(&mut self) -> Option<String> {
        match self.read_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Dropped diagnostic input from {}: {}", self.name, e);
                None
            }
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, DecodeError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(None);
        };

        let available = port.bytes_available()?;
        if available > 0 {
            let mut chunk = vec![0u8; available];
            let read = port.read(&mut chunk)?;
            self.inbound.extend_from_slice(&chunk[..read]);
        }

        // Keep the newest input: drop the oldest whole lines once over the limit
        while self.inbound.len() > MAX_LINE_LEN {
            match self.inbound.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.inbound.drain(..=end);
                }
                None => {
                    self.inbound.clear();
                    return Err(DecodeError::Overlong(MAX_LINE_LEN));
                }
            }
        }

        let Some(end) = self.inbound.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        let raw: Vec<u8> = self.inbound.drain(..=end).collect();
        let line = String::from_utf8(raw)?;
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line.to_string()))
    }

    /// Stops the motors and releases the port. Closing twice is a no-op.
    ///
    /// The port is released even when the final `Stop` cannot be written.
    pub fn close(&mut self) -> Result<(), LinkError> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };

        let result = write_command(&mut port, Command::Stop);
        if result.is_ok() && !self.stop_settle.is_zero() {
            std::thread::sleep(self.stop_settle);
        }
        drop(port);
        self.inbound.clear();

        tracing::info!("Closed serial link {}", self.name);
        result
    }
}

fn write_command<T: Transport>(port: &mut T, command: Command) -> Result<(), LinkError> {
    port.write_all(&[command.code()])
        .and_then(|_| port.flush())
        .map_err(|e| LinkError::Write(command, e))
}

impl<T: Transport> Drop for MotorLink<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Failed to stop motors while closing {}: {}", self.name, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    fn link() -> (MotorLink<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let link = MotorLink::from_transport(transport.clone(), "mock", Duration::ZERO);
        (link, transport)
    }

    #[test]
    fn test_send_writes_single_byte_per_command() {
        let (mut link, transport) = link();

        for command in Command::ALL {
            link.send(command).unwrap();
        }

        assert_eq!(transport.sent_commands(), Command::ALL.to_vec());
    }

    #[test]
    fn test_write_failure_is_reported() {
        let (mut link, transport) = link();
        transport.fail_writes();

        assert!(matches!(
            link.send(Command::Forward),
            Err(LinkError::Write(Command::Forward, _))
        ));
    }

    #[test]
    fn test_close_sends_stop_once_and_is_idempotent() {
        let (mut link, transport) = link();
        link.send(Command::Left).unwrap();

        link.close().unwrap();
        link.close().unwrap();

        assert!(!link.is_open());
        assert_eq!(transport.sent_commands(), vec![Command::Left, Command::Stop]);
        assert!(matches!(link.send(Command::Forward), Err(LinkError::Closed)));
    }

    #[test]
    fn test_close_releases_port_even_if_stop_fails() {
        let (mut link, transport) = link();
        transport.fail_writes();

        assert!(link.close().is_err());
        assert!(!link.is_open());
    }

    #[test]
    fn test_drop_stops_motors() {
        let (link, transport) = link();
        drop(link);

        assert_eq!(transport.sent_commands(), vec![Command::Stop]);
    }

    #[test]
    fn test_poll_returns_complete_lines_only() {
        let (mut link, transport) = link();
        assert_eq!(link.poll_diagnostics(), None);

        transport.push_inbound(b"speed=12");
        assert_eq!(link.poll_diagnostics(), None);

        transport.push_inbound(b"0\r\nok\n");
        assert_eq!(link.poll_diagnostics(), Some("speed=120".to_string()));
        assert_eq!(link.poll_diagnostics(), Some("ok".to_string()));
        assert_eq!(link.poll_diagnostics(), None);
    }

    #[test]
    fn test_poll_swallows_invalid_text() {
        let (mut link, transport) = link();
        transport.push_inbound(&[0xff, 0xfe, b'\n']);
        assert_eq!(link.poll_diagnostics(), None);

        transport.push_inbound(b"ready\n");
        assert_eq!(link.poll_diagnostics(), Some("ready".to_string()));
    }

    #[test]
    fn test_poll_keeps_backlog_bounded_when_lines_outpace_polls() {
        let (mut link, transport) = link();

        for _ in 0..1000 {
            transport.push_inbound(b"spd=1\nspd=2\nspd=3\n");
            assert!(link.poll_diagnostics().is_some());
            assert!(link.inbound.len() <= MAX_LINE_LEN);
        }

        // the newest line survives the trimming
        transport.push_inbound(b"last\n");
        let mut latest = None;
        while let Some(line) = link.poll_diagnostics() {
            latest = Some(line);
        }
        assert_eq!(latest, Some("last".to_string()));
    }

    #[test]
    fn test_poll_discards_overlong_input() {
        let (mut link, transport) = link();
        transport.push_inbound(&vec![b'x'; MAX_LINE_LEN + 1]);
        assert_eq!(link.poll_diagnostics(), None);

        transport.push_inbound(b"tail\n");
        assert_eq!(link.poll_diagnostics(), Some("tail".to_string()));
    }
}
