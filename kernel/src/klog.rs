//! Kernel logger
//!
//! Backend for the `log` facade used throughout the executive. Records
//! are formatted as `[LEVEL] target: message` into a text sink guarded
//! by a spin lock. On x86_64 the sink is the COM1 serial port (QEMU
//! serial console).

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Fixed-width level name for aligned output
fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// `log` backend writing to `W`
pub struct KernelLogger<W> {
    sink: Mutex<W>,
    level: LevelFilter,
}

impl<W: Write + Send> KernelLogger<W> {
    /// Logger passing records up to `level` to `sink`
    pub const fn new(sink: W, level: LevelFilter) -> Self {
        Self {
            sink: Mutex::new(sink),
            level,
        }
    }

    #[inline]
    pub fn level(&self) -> LevelFilter {
        self.level
    }

    /// Run `f` with the sink locked
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.sink.lock())
    }
}

impl<W: Write + Send> Log for KernelLogger<W> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = self.sink.lock();
        // Nowhere to report a failing console
        let _ = writeln!(
            sink,
            "[{}] {}: {}",
            level_name(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install `logger` as the global `log` backend
///
/// Fails if a logger is already installed.
pub fn init(logger: &'static dyn Log, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(target_arch = "x86_64")]
pub use serial::{init_serial, SerialWriter};

#[cfg(target_arch = "x86_64")]
mod serial {
    use super::*;
    use x86_64::instructions::port::{Port, PortReadOnly};

    /// COM1 port address
    const COM1: u16 = 0x3F8;

    /// Line status register offset
    const LINE_STATUS: u16 = 5;

    /// Transmit holding register empty
    const THR_EMPTY: u8 = 0x20;

    /// 16550 UART transmitter (already initialized by the bootloader)
    pub struct SerialWriter {
        data: Port<u8>,
        line_status: PortReadOnly<u8>,
    }

    impl SerialWriter {
        pub const fn new(base: u16) -> Self {
            Self {
                data: Port::new(base),
                line_status: PortReadOnly::new(base + LINE_STATUS),
            }
        }

        /// Write a byte to the port
        fn write_byte(&mut self, byte: u8) {
            // SAFETY: COM1 is owned by the kernel console; the writer is
            // only reached through the logger's lock.
            unsafe {
                // Wait for transmit buffer to be empty
                while self.line_status.read() & THR_EMPTY == 0 {
                    core::hint::spin_loop();
                }
                self.data.write(byte);
            }
        }
    }

    impl Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                if byte == b'\n' {
                    self.write_byte(b'\r');
                }
                self.write_byte(byte);
            }
            Ok(())
        }
    }

    static SERIAL_LOGGER: KernelLogger<SerialWriter> =
        KernelLogger::new(SerialWriter::new(COM1), LevelFilter::Trace);

    /// Log to COM1, up to `level`
    pub fn init_serial(level: LevelFilter) -> Result<(), SetLoggerError> {
        init(&SERIAL_LOGGER, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn test_records_are_formatted_and_filtered() {
        let logger = KernelLogger::new(String::new(), LevelFilter::Info);

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("ke")
                .args(format_args!("cpu {} online", 0))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .target("ke")
                .args(format_args!("filtered"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("io")
                .args(format_args!("slow waiter"))
                .build(),
        );

        logger.with_sink(|out| {
            assert_eq!(out.as_str(), "[INFO ] ke: cpu 0 online\n[WARN ] io: slow waiter\n");
        });
        assert!(!logger.enabled(&Metadata::builder().level(Level::Trace).build()));
        assert_eq!(logger.level(), LevelFilter::Info);
    }
}
