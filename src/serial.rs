//! Byte-level serial capability used by the UART sensors and the GPS stream.
//!
//! Reads never block: they return whatever the port has buffered (possibly
//! nothing). Drivers build their own bounded waits on top with the
//! [`Clock`](crate::clock::Clock).

use crate::devices::SensorError;

pub trait SerialPort {
    /// Copy buffered bytes into `buf`, returning how many were copied.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SensorError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), SensorError>;

    /// Drop any buffered input.
    fn discard_input(&mut self) -> Result<(), SensorError> {
        let mut scratch = [0u8; 32];
        while self.read(&mut scratch)? > 0 {}
        Ok(())
    }
}

impl<T: SerialPort + ?Sized> SerialPort for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
        (**self).read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SensorError> {
        (**self).write_all(data)
    }

    fn discard_input(&mut self) -> Result<(), SensorError> {
        (**self).discard_input()
    }
}

/// Open a UART at 8N1.
#[cfg(all(target_os = "linux", feature = "hardware"))]
pub fn open_uart(path: &str, baud: u32) -> Result<Box<dyn SerialPort>, SensorError> {
    uart::UartPort::open(path, baud).map(|port| Box::new(port) as Box<dyn SerialPort>)
}

/// Open a UART at 8N1.
#[cfg(not(all(target_os = "linux", feature = "hardware")))]
pub fn open_uart(path: &str, _baud: u32) -> Result<Box<dyn SerialPort>, SensorError> {
    Err(SensorError::Unsupported(format!(
        "{path}: hardware support not compiled in (rebuild with --features hardware)"
    )))
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
mod uart {
    use super::SerialPort;
    use crate::devices::SensorError;
    use rppal::uart::{Parity, Uart};
    use std::time::Duration;

    pub struct UartPort {
        uart: Uart,
    }

    impl UartPort {
        pub fn open(path: &str, baud: u32) -> Result<Self, SensorError> {
            let mut uart = Uart::with_path(path, baud, Parity::None, 8, 1)
                .map_err(|e| SensorError::Io(format!("{path}: {e}")))?;
            // min_length 0 + zero timeout: reads return immediately
            uart.set_read_mode(0, Duration::ZERO)
                .map_err(|e| SensorError::Io(format!("{path}: {e}")))?;
            Ok(Self { uart })
        }
    }

    impl SerialPort for UartPort {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, SensorError> {
            self.uart
                .read(buf)
                .map_err(|e| SensorError::Io(e.to_string()))
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), SensorError> {
            let mut written = 0;
            while written < data.len() {
                written += self
                    .uart
                    .write(&data[written..])
                    .map_err(|e| SensorError::Io(e.to_string()))?;
            }
            Ok(())
        }
    }
}
