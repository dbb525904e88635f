//! Byte transport to the EnOcean transceiver: a local serial port at
//! 57600 8N1 without flow control, or a raw TCP link given as
//! `tcp:<host>:<port>`. Reads block with a 1 second timeout so the reader
//! thread can observe its shutdown flag between reads.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::info;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::BridgeError;

pub const BAUD_RATE: u32 = 57_600;
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub enum Transport {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

impl Transport {
    pub fn open(spec: &str) -> Result<Self, BridgeError> {
        if let Some(addr) = spec.strip_prefix("tcp:") {
            let resolved = addr
                .to_socket_addrs()
                .map_err(BridgeError::TransportOpenError)?
                .next()
                .ok_or_else(|| {
                    BridgeError::TransportOpenError(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no address found for {addr}"),
                    ))
                })?;
            let stream = TcpStream::connect_timeout(&resolved, TCP_CONNECT_TIMEOUT)
                .map_err(BridgeError::TransportOpenError)?;
            stream
                .set_read_timeout(Some(READ_TIMEOUT))
                .map_err(BridgeError::TransportOpenError)?;
            info!("connected to EnOcean transceiver at {addr}");
            Ok(Transport::Tcp(stream))
        } else {
            let port = serialport::new(spec, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(READ_TIMEOUT)
                .open()?;
            info!("serial port opened: {spec} @ {BAUD_RATE} baud");
            Ok(Transport::Serial(port))
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Transport::Tcp(_))
    }

    /// Blocking read. A read timeout surfaces as `Ok(0)`; a closed TCP
    /// connection surfaces as an error so the reader tears down.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match self {
            Transport::Serial(port) => port.read(buf),
            Transport::Tcp(stream) => match stream.read(buf) {
                Ok(0) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transceiver closed the connection",
                )),
                other => other,
            },
        };

        match result {
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(0)
            }
            other => other,
        }
    }

    /// A cloned handle for the outbound path; frames are written in a
    /// single call.
    pub fn writer(&self) -> Result<TransportWriter, BridgeError> {
        match self {
            Transport::Serial(port) => Ok(TransportWriter::Serial(port.try_clone()?)),
            Transport::Tcp(stream) => Ok(TransportWriter::Tcp(
                stream.try_clone().map_err(BridgeError::TransportOpenError)?,
            )),
        }
    }
}

/// Write handle shared between the reader thread (which replaces it on
/// reconnect) and the dispatcher (which sends outbound frames through it).
pub type SharedWriter = std::sync::Arc<std::sync::Mutex<TransportWriter>>;

pub enum TransportWriter {
    Serial(Box<dyn SerialPort>),
    Tcp(TcpStream),
}

impl TransportWriter {
    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            TransportWriter::Serial(port) => {
                port.write_all(frame)?;
                port.flush()
            }
            TransportWriter::Tcp(stream) => {
                stream.write_all(frame)?;
                stream.flush()
            }
        }
    }
}
