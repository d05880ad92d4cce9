/*!
    byte level connection to the modem

    the channel only needs an [AsyncRead] half to ingest bytes and an [AsyncWrite] half to send raw bytes. With the `serial` feature, both halves are obtained from a serial port.
*/

use std::{
    pin::Pin,
    io,
    };
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};


/// receiving half of a transport
pub type Reader = Pin<Box<dyn AsyncRead + Send>>;
/// sending half of a transport
pub type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// parity bit setting of a serial line
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}
/// number of stop bits of a serial line
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/**
    serial port settings

    modems almost all default to `115200 8N1`, which is what [Default] gives
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerialConfig {
    /// device path, like `/dev/ttyUSB0` or `COM3`
    pub path: String,
    pub baud_rate: u32,
    pub parity: Parity,
    /// number of data bits per character, from 5 to 8
    pub data_bits: u8,
    pub stop_bits: StopBits,
}
impl SerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {path: path.into(), baud_rate, .. Default::default()}
    }
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }
    pub fn stop_bits(mut self, bits: StopBits) -> Self {
        self.stop_bits = bits;
        self
    }
}
impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 115_200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
        }
    }
}

/// open a serial port and split it in a receive and a transmit half
#[cfg(feature = "serial")]
pub fn open(config: &SerialConfig) -> io::Result<(Reader, Writer)> {
    use serial2_tokio::{SerialPort, CharSize};

    let char_size = match config.data_bits {
        5 => CharSize::Bits5,
        6 => CharSize::Bits6,
        7 => CharSize::Bits7,
        8 => CharSize::Bits8,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "data bits must be between 5 and 8")),
    };
    let receive = SerialPort::open(&config.path, |mut settings: serial2_tokio::Settings| {
            settings.set_raw();
            settings.set_baud_rate(config.baud_rate)?;
            settings.set_char_size(char_size);
            settings.set_stop_bits(match config.stop_bits {
                StopBits::One => serial2_tokio::StopBits::One,
                StopBits::Two => serial2_tokio::StopBits::Two,
                });
            settings.set_parity(match config.parity {
                Parity::None => serial2_tokio::Parity::None,
                Parity::Odd => serial2_tokio::Parity::Odd,
                Parity::Even => serial2_tokio::Parity::Even,
                });
            Ok(settings)
            })?;
    let transmit: Writer = Box::pin(receive.try_clone()?);
    let receive: Reader = Box::pin(receive);
    Ok((receive, transmit))
}

/// write all bytes and flush them to the line
pub(crate) async fn write_all(writer: &mut Writer, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
