//! Flat-text export of one acquisition
//!
//! One line per sample, two right-aligned fields separated by `", "`,
//! each printed like C's `%10g`:
//!
//! ```text
//!  -1.6e-06,         12
//!  -1.5e-06,         14
//! ```
//!
//! Exports hold their own reference on the buffer for the whole write, so
//! the acquisition loop cannot recycle it underneath them.

use crate::acquisition::buffer::SampleBuffer;
use crate::acquisition::pool::PooledBuffer;
use crate::acquisition::scoped::{with_scoped_buffer, ScopedBuffer};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use thiserror::Error;

/// Errors reported to whoever requested an export
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No data to export")]
    NoData,

    #[error("Channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which two columns to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Columns {
    /// Time and the samples of one channel
    TimeAndChannel(usize),
    /// Samples of two channels side by side
    ChannelPair(usize, usize),
}

impl Default for Columns {
    fn default() -> Self {
        Columns::TimeAndChannel(0)
    }
}

/// Format `value` the way C's `%g` does
///
/// Six significant digits, trailing zeros removed, exponent form with a
/// signed two-digit exponent when the exponent is below -4 or at least 6.
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Exponent after rounding to the target precision
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            strip_trailing_zeros(mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_trailing_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Write `buffer` to `path`; returns the number of lines written
pub fn write_text(
    buffer: &SampleBuffer,
    columns: Columns,
    path: &Path,
) -> Result<usize, ExportError> {
    let channels = buffer.channels();
    let check = |channel: usize| {
        if channel < channels {
            Ok(())
        } else {
            Err(ExportError::ChannelOutOfRange { channel, channels })
        }
    };

    let rows: Box<dyn Iterator<Item = (f64, f64)> + '_> = match columns {
        Columns::TimeAndChannel(ch) => {
            check(ch)?;
            Box::new(buffer.points(ch))
        }
        Columns::ChannelPair(a, b) => {
            check(a)?;
            check(b)?;
            Box::new(buffer.y_values(a).zip(buffer.y_values(b)))
        }
    };

    let mut out = BufWriter::new(File::create(path)?);
    let mut lines = 0;
    for (first, second) in rows {
        writeln!(out, "{:>10}, {:>10}", format_g(first), format_g(second))?;
        lines += 1;
    }
    out.flush()?;

    tracing::info!(path = %path.display(), lines, "Frame exported");
    Ok(lines)
}

/// Write `buffer` while holding a scoped reference on it
///
/// The reference is released on every path, including write errors.
pub fn export_scoped(
    buffer: Option<&PooledBuffer>,
    columns: Columns,
    path: &Path,
) -> Result<usize, ExportError> {
    with_scoped_buffer(buffer, |contents| match contents {
        Some(b) => write_text(b, columns, path),
        None => Err(ExportError::NoData),
    })
    .inspect_err(|e| tracing::warn!(path = %path.display(), error = %e, "Export failed"))
}

/// Export on a background thread that keeps its own reference
pub fn spawn_export(
    buffer: Option<&PooledBuffer>,
    columns: Columns,
    path: impl Into<PathBuf>,
) -> Result<JoinHandle<Result<PathBuf, ExportError>>, ExportError> {
    let guard = ScopedBuffer::acquire(buffer);
    let path = path.into();

    let handle = std::thread::Builder::new()
        .name("export".into())
        .spawn(move || {
            let result = match guard.read() {
                Some(contents) => write_text(&contents, columns, &path),
                None => Err(ExportError::NoData),
            };
            drop(guard);
            result.map(|_| path)
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::buffer::AxisParams;
    use crate::acquisition::pool::BufferPool;
    use crate::device::SampleSize;

    #[test]
    fn test_format_g_fixed() {
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(1.0), "1");
        assert_eq!(format_g(-12.0), "-12");
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(3.14159265), "3.14159");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(0.0001), "0.0001");
        assert_eq!(format_g(100.0), "100");
    }

    #[test]
    fn test_format_g_exponent() {
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(999999.5), "1e+06");
        assert_eq!(format_g(0.00001), "1e-05");
        assert_eq!(format_g(-2.5e-7), "-2.5e-07");
        assert_eq!(format_g(1.0e100), "1e+100");
        assert_eq!(format_g(8.333333333e-9), "8.33333e-09");
    }

    #[test]
    fn test_format_g_special() {
        assert_eq!(format_g(f64::NAN), "nan");
        assert_eq!(format_g(f64::INFINITY), "inf");
        assert_eq!(format_g(f64::NEG_INFINITY), "-inf");
    }

    fn sample_buffer() -> SampleBuffer {
        let mut buf = SampleBuffer::new(3, 2);
        buf.update_x(AxisParams {
            pre_trigger: 1,
            scale: 0.5,
        });
        buf.update_y(&[10, 1, 20, 2, 30, 3], SampleSize::OneByte, 0);
        buf
    }

    #[test]
    fn test_write_time_and_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.txt");

        let lines = write_text(&sample_buffer(), Columns::TimeAndChannel(0), &path).unwrap();
        assert_eq!(lines, 3);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "      -0.5,         10\n         0,         20\n       0.5,         30\n"
        );
    }

    #[test]
    fn test_write_channel_pair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pair.txt");

        write_text(&sample_buffer(), Columns::ChannelPair(0, 1), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(first, "        10,          1");
    }

    #[test]
    fn test_channel_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_text(
            &sample_buffer(),
            Columns::TimeAndChannel(2),
            &dir.path().join("x.txt"),
        );
        assert!(matches!(
            result,
            Err(ExportError::ChannelOutOfRange {
                channel: 2,
                channels: 2
            })
        ));
    }

    #[test]
    fn test_export_scoped_releases_on_io_error() {
        let pool = BufferPool::new(1, 4, 1);
        let buf = pool.acquire().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let bad_path = dir.path().join("missing").join("frame.txt");

        let result = export_scoped(Some(&buf), Columns::default(), &bad_path);
        assert!(matches!(result, Err(ExportError::Io(_))));
        assert_eq!(pool.refcount(buf.index()), 1);

        assert!(matches!(
            export_scoped(None, Columns::default(), &bad_path),
            Err(ExportError::NoData)
        ));
    }

    #[test]
    fn test_spawn_export_holds_reference() {
        let pool = BufferPool::new(1, 4, 1);
        let buf = pool.acquire().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.txt");

        let handle = spawn_export(Some(&buf), Columns::default(), path.clone()).unwrap();
        // Our handle goes away first; the export keeps the buffer out of the pool
        drop(buf);
        let written = handle.join().unwrap().unwrap();
        assert_eq!(written, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 4);
        assert_eq!(pool.available(), 1);
    }
}
