//! G3 bridge logging utilities
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
use core::cell::RefCell;
use core::fmt::Write;
use critical_section::Mutex;
use heapless::String;

/// A logging buffer for storing serialized logs pending transmission.
///
/// # Notes
/// The BufferedLog contains a character buffer of the log data waiting to be written. It is
/// intended to be consumed asynchronously. In the case of the bridge, this log data is consumed in
/// the print task, which forwards it to the debug UART.
pub struct BufferedLog {
    buffer: Mutex<RefCell<LogBuffer>>,
}

impl BufferedLog {
    pub const fn new() -> Self {
        Self {
            buffer: Mutex::new(RefCell::new(LogBuffer::new())),
        }
    }

    /// Install the log as the global logger.
    ///
    /// # Args
    /// * `level` - The most verbose level that will be recorded.
    pub fn install(&'static self, level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }

    /// Process all of the available log data.
    ///
    /// # Args
    /// * `sink` - Consumer of the pending log bytes, e.g. the print task UART writer.
    pub fn process<F: FnMut(&[u8])>(&self, mut sink: F) {
        critical_section::with(|cs| {
            let mut buffer = self.buffer.borrow_ref_mut(cs);
            sink(buffer.data());
            buffer.clear();
        });
    }
}

impl Default for BufferedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for BufferedLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        let source_file = record.file().unwrap_or("Unknown");
        let source_line = record.line().unwrap_or(u32::MAX);

        // Print the record into the buffer. A record that does not fit is kept truncated.
        let mut string: String<128> = String::new();
        write!(
            &mut string,
            "[{}] {}:{} - {}\n",
            record.level(),
            source_file,
            source_line,
            record.args()
        )
        .ok();

        critical_section::with(|cs| {
            self.buffer.borrow_ref_mut(cs).append(string.as_bytes());
        });
    }

    // The log is not capable of being flushed as it does not own the data consumer.
    fn flush(&self) {}
}

/// The number of log bytes held until the print task drains them.
pub const LOG_CAPACITY: usize = 1024;

/// Serialized records waiting for the print task.
struct LogBuffer(heapless::Vec<u8, LOG_CAPACITY>);

impl LogBuffer {
    const fn new() -> Self {
        Self(heapless::Vec::new())
    }

    /// Append as much of `data` as fits.
    fn append(&mut self, data: &[u8]) {
        let room = LOG_CAPACITY - self.0.len();
        let data = &data[..data.len().min(room)];
        self.0.extend_from_slice(data).ok();
    }

    fn data(&self) -> &[u8] {
        &self.0
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}
