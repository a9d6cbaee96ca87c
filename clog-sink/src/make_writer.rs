//! Plugging the sink into `tracing-subscriber`.
//!
//! The fmt layer renders each event into a buffer and hands it over with a
//! single `write_all`, so every `write` here is exactly one record.
//!
//! ```no_run
//! use std::sync::Arc;
//! use clog_sink::{ConcurrentRotatingSink, SinkConfig};
//!
//! let sink = Arc::new(ConcurrentRotatingSink::open(SinkConfig::new("/var/log/app.log"))?);
//! tracing_subscriber::fmt().with_writer(sink).with_ansi(false).init();
//! # Ok::<(), clog_sink::SinkError>(())
//! ```

use std::io;

use clog_fs::Filesystem;
use tracing_subscriber::fmt::MakeWriter;

use crate::sink::ConcurrentRotatingSink;

impl<F: Filesystem> io::Write for &ConcurrentRotatingSink<F> {
    /// Emits `buf` as one record. Never fails: a dropped record has already
    /// been reported to the sink's diagnostic logger.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.emit(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Every emit flushes.
        Ok(())
    }
}

impl<'a, F: Filesystem + 'a> MakeWriter<'a> for ConcurrentRotatingSink<F> {
    type Writer = &'a ConcurrentRotatingSink<F>;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}
