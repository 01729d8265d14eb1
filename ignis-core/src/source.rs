//! Source image preparation.
//!
//! Two jobs live here:
//! 1.  Decompressing compressed source images (`.gz`, `.xz`, `.zst`) to a
//!     temporary file so planning and writing always see raw bytes.
//! 2.  Sniffing the image format (ISO 9660 / MBR), which the planner needs
//!     when multi-boot layouts or boot patches are requested.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::{NamedTempFile, TempPath};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::PlanError;

/// Byte offset of the ISO 9660 primary volume descriptor (sector 16 of
/// 2048-byte sectors). The five bytes at `PVD_OFFSET + 1` spell `CD001`.
pub(crate) const ISO_PVD_OFFSET: u64 = 16 * 2048;
pub(crate) const ISO_MAGIC: &[u8; 5] = b"CD001";

/// Byte offset of the MBR boot signature `0x55 0xAA`.
pub(crate) const MBR_SIGNATURE_OFFSET: u64 = 510;

/// Recognized bootable image formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// ISO 9660 optical image (has a primary volume descriptor).
    Iso9660,
    /// Raw disk image with an MBR boot sector.
    Mbr,
    /// No recognized signature. Still writable as a raw full-device copy.
    Unknown,
}

/// A source image ready for planning and writing.
///
/// If the input was compressed, this owns the decompressed temp file and
/// deletes it on drop; it must therefore outlive the write session.
pub struct PreparedSource {
    path: PathBuf,
    _temp_handle: Option<TempPath>,
}

impl PreparedSource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for PreparedSource {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Prepares a source image for writing, decompressing it if necessary.
///
/// Uncompressed images are passed through untouched. `cancel` is checked
/// between decompression chunks; `on_progress` receives the cumulative
/// number of decompressed bytes.
pub fn prepare_source<F>(
    input_path: &Path,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> io::Result<PreparedSource>
where
    F: FnMut(u64),
{
    let ext = input_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let input_file = File::open(input_path)?;

    let mut reader: Box<dyn Read> = match ext.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input_file))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input_file))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input_file))?),
        // Not a compressed file; hand back the original path.
        _ => {
            return Ok(PreparedSource {
                path: input_path.to_path_buf(),
                _temp_handle: None,
            });
        }
    };

    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "operation cancelled by user",
                ));
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(total);
        }
        writer.flush()?;
    }

    let temp_path = temp_file.into_temp_path();
    Ok(PreparedSource {
        path: temp_path.to_path_buf(),
        _temp_handle: Some(temp_path),
    })
}

/// Sniffs the bootable format of an (uncompressed) image file.
pub fn sniff_format(path: &Path) -> Result<ImageFormat, PlanError> {
    let mut file = File::open(path).map_err(PlanError::SourceUnreadable)?;
    let len = file
        .metadata()
        .map_err(PlanError::SourceUnreadable)?
        .len();

    // ISO check first: an El Torito hybrid ISO carries an MBR too, and the
    // richer format should win.
    if len >= ISO_PVD_OFFSET + 2048 {
        let mut magic = [0u8; 5];
        file.seek(SeekFrom::Start(ISO_PVD_OFFSET + 1))
            .map_err(PlanError::SourceUnreadable)?;
        file.read_exact(&mut magic)
            .map_err(PlanError::SourceUnreadable)?;
        if &magic == ISO_MAGIC {
            return Ok(ImageFormat::Iso9660);
        }
    }

    if len >= MBR_SIGNATURE_OFFSET + 2 {
        let mut sig = [0u8; 2];
        file.seek(SeekFrom::Start(MBR_SIGNATURE_OFFSET))
            .map_err(PlanError::SourceUnreadable)?;
        file.read_exact(&mut sig)
            .map_err(PlanError::SourceUnreadable)?;
        if sig == [0x55, 0xAA] {
            return Ok(ImageFormat::Mbr);
        }
    }

    Ok(ImageFormat::Unknown)
}
