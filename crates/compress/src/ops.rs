//! Frame Operations

use crate::Compression;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use tracing::instrument;
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Frames are decompressed on every cache miss, so the read path matters more
// than the archive size. Use the fastest level each codec offers.
const GZIP_LEVEL: GzCompression = GzCompression::fast();
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 1;

impl Compression {
    /// Compress one chunk into a self-contained frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use lazyblob_compress::Compression;
    ///
    /// let frame = Compression::Gzip.compress(b"0123456789").unwrap();
    /// assert_eq!(Compression::Gzip.decompress(&frame).unwrap(), b"0123456789");
    /// ```
    #[instrument(skip(input), fields(format = %self, input_size = input.len(), output_size))]
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let output = match self {
            Compression::None => input.to_vec(),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), GZIP_LEVEL);
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = ZstdEncoder::new(Vec::new(), ZSTD_LEVEL).or_raise(|| ErrorKind::Encoder)?;
                encoder.write_all(input).or_raise(|| ErrorKind::Io)?;
                encoder.finish().or_raise(|| ErrorKind::Io)?
            },
        };
        tracing::Span::current().record("output_size", output.len());
        Ok(output)
    }

    /// Decompress a whole frame in memory.
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        self.wrap_reader(input)?.read_to_end(&mut output).or_raise(|| ErrorKind::InvalidData)?;
        Ok(output)
    }

    /// Decompress a frame into `output`, which must be exactly the size of
    /// the decompressed chunk.
    ///
    /// Fails with [`LengthMismatch`](ErrorKind::LengthMismatch) if the frame
    /// holds fewer or more bytes than `output` can take. The TOC records the
    /// decompressed chunk size, so anything else means the frame does not
    /// belong to that chunk.
    ///
    /// # Examples
    ///
    /// ```
    /// use lazyblob_compress::Compression;
    ///
    /// let frame = Compression::Gzip.compress(b"abc").unwrap();
    /// let mut chunk = [0u8; 3];
    /// Compression::Gzip.decompress_exact(&frame, &mut chunk).unwrap();
    /// assert_eq!(&chunk, b"abc");
    ///
    /// let mut too_big = [0u8; 4];
    /// assert!(Compression::Gzip.decompress_exact(&frame, &mut too_big).is_err());
    /// ```
    #[instrument(skip(input, output), fields(format = %self, input_size = input.len(), output_size = output.len()))]
    pub fn decompress_exact(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        let mut reader = self.wrap_reader(input)?;
        let mut filled = 0;
        while filled < output.len() {
            match reader.read(&mut output[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).or_raise(|| ErrorKind::InvalidData),
            }
        }
        if filled < output.len() {
            exn::bail!(ErrorKind::LengthMismatch { expected: output.len(), actual: filled });
        }
        // Anything left in the frame past the recorded size is just as wrong.
        let mut probe = [0u8; 1];
        if reader.read(&mut probe).or_raise(|| ErrorKind::InvalidData)? != 0 {
            exn::bail!(ErrorKind::LengthMismatch { expected: output.len(), actual: output.len() + 1 });
        }
        Ok(())
    }

    /// Wrap a reader with the appropriate decompression layer.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::io::{Cursor, Read};
    /// use lazyblob_compress::Compression;
    ///
    /// let frame = Compression::Gzip.compress(b"Hello, world!").unwrap();
    /// let mut reader = Compression::Gzip.wrap_reader(Cursor::new(frame)).unwrap();
    /// let mut out = Vec::new();
    /// reader.read_to_end(&mut out).unwrap();
    /// assert_eq!(out, b"Hello, world!");
    /// ```
    pub fn wrap_reader<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(GzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::Encoder)?),
        })
    }
}
