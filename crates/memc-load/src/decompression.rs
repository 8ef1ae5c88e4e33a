//! Streaming gzip line reader for input files
//!
//! Input files can be large, so they are decompressed and split into lines
//! incrementally instead of being inflated into memory.
//!
//! # Examples
//!
//! ```rust,ignore
//! use memc_load::decompression::GzipLines;
//!
//! for line in GzipLines::open("/data/appsinstalled/20170929000000.tsv.gz")? {
//!     let bytes = line?;
//!     // ...
//! }
//! ```

use flate2::bufread::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/// Iterator over the raw lines of a gzip stream
///
/// Lines are yielded as bytes, including any trailing newline, so that
/// callers decide how to treat invalid UTF-8. Concatenated gzip members are
/// read as one stream.
pub struct GzipLines<R: Read> {
    reader: BufReader<MultiGzDecoder<BufReader<R>>>,
}

impl GzipLines<File> {
    /// Open a gzip file for line-by-line reading
    ///
    /// Fails if the file cannot be opened or does not start with a valid
    /// gzip header.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::new(file)
    }
}

impl<R: Read> GzipLines<R> {
    pub fn new(inner: R) -> io::Result<Self> {
        let mut reader = BufReader::new(MultiGzDecoder::new(BufReader::new(inner)));

        // Surface header errors here instead of on the first line.
        reader.fill_buf()?;

        Ok(Self { reader })
    }
}

impl<R: Read> Iterator for GzipLines<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => Some(Ok(line)),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::{Cursor, Write};

    fn create_gzip_data(content: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_reads_lines() {
        let compressed = create_gzip_data(b"first\nsecond\n\nlast");
        let lines: Vec<Vec<u8>> = GzipLines::new(Cursor::new(compressed))
            .unwrap()
            .collect::<io::Result<_>>()
            .unwrap();

        assert_eq!(
            lines,
            vec![
                b"first\n".to_vec(),
                b"second\n".to_vec(),
                b"\n".to_vec(),
                b"last".to_vec()
            ]
        );
    }

    #[test]
    fn test_reads_concatenated_members() {
        let mut compressed = create_gzip_data(b"one\n");
        compressed.extend(create_gzip_data(b"two\n"));

        let count = GzipLines::new(Cursor::new(compressed)).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_invalid_gzip_fails_on_open() {
        assert!(GzipLines::new(Cursor::new(b"not gzip data".to_vec())).is_err());
    }

    #[test]
    fn test_truncated_stream_reports_error() {
        let mut compressed = create_gzip_data(&b"line\n".repeat(10_000));
        compressed.truncate(compressed.len() / 2);

        let mut lines = GzipLines::new(Cursor::new(compressed)).unwrap();
        assert!(lines.any(|line| line.is_err()));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GzipLines::open(dir.path().join("missing.tsv.gz")).is_err());
    }
}
