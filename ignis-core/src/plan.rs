//! Write planning.
//!
//! [`ImagePlanner`] inspects a source image and the requested options and
//! produces a [`WritePlan`]: an ordered, capacity-checked list of disjoint
//! regions to put on the device. Plans are immutable once built; the write
//! engine treats them as read-only work orders.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::device::{BlockTarget, DeviceDescriptor, DeviceId};
use crate::error::PlanError;
use crate::source::{self, ImageFormat};

/// Marker payload written into the ISO 9660 application-use area by the
/// boot-requirement bypass option. The application-use field of the primary
/// volume descriptor is free-form scratch space, so installers that honor
/// the flag can read it without the patch breaking the ISO structure.
pub const BYPASS_PATCH_PAYLOAD: &[u8] = b"IGNIS BYPASS V1: TPM=0 SECUREBOOT=0 RAMCHECK=0";

/// Offset of the application-use field within the primary volume descriptor.
const PVD_APPLICATION_USE_OFFSET: u64 = 883;

const MBR_PARTITION_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

/// What a planned region holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Bytes copied verbatim from the source image, starting at
    /// `source_offset` within the image file.
    RawImageCopy { source_offset: u64 },
    /// Zero-initialized storage reserved for a persistence partition.
    PersistencePartition,
    /// Zeroed filler (alignment gaps ahead of the persistence area).
    ZeroFill,
    /// A fixed byte-level edit applied inside the copied image area.
    BootPatch { payload: Vec<u8> },
}

/// A contiguous byte range on the target device.
///
/// Regions within one plan are non-overlapping and sorted by offset; the
/// planner enforces both at construction.
#[derive(Clone, Debug)]
pub struct Region {
    pub offset_bytes: u64,
    pub length_bytes: u64,
    pub kind: SourceKind,
    /// SHA-256 of the corresponding source bytes, computed once at plan
    /// time. Present for `RawImageCopy` regions; other kinds are verified
    /// structurally instead.
    pub expected_digest: Option<[u8; 32]>,
}

impl Region {
    pub fn end_bytes(&self) -> u64 {
        self.offset_bytes + self.length_bytes
    }
}

/// Burning options, mirroring what the front-end exposes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Reserve a persistence partition after the image.
    pub persistence: bool,
    /// Place the image after existing content instead of at offset 0.
    pub multi_boot: bool,
    /// Patch install-time hardware-requirement checks in the copied image.
    pub boot_requirement_bypass: bool,
}

/// Deterministic sizing knobs for the planner.
#[derive(Clone, Copy, Debug)]
pub struct PlannerConfig {
    /// Upper bound on the persistence partition size.
    pub persistence_ceiling_bytes: u64,
    /// Alignment for region starts that we choose ourselves.
    pub alignment_bytes: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            persistence_ceiling_bytes: 4 * 1024 * 1024 * 1024,
            alignment_bytes: 1024 * 1024,
        }
    }
}

/// The work order for one burn: where every byte on the device comes from.
#[derive(Clone, Debug)]
pub struct WritePlan {
    source_image_path: PathBuf,
    source_image_size_bytes: u64,
    target_device_id: DeviceId,
    target_capacity_bytes: u64,
    regions: Vec<Region>,
    options: WriteOptions,
}

impl WritePlan {
    pub fn source_image_path(&self) -> &Path {
        &self.source_image_path
    }

    pub fn source_image_size_bytes(&self) -> u64 {
        self.source_image_size_bytes
    }

    pub fn target_device_id(&self) -> &DeviceId {
        &self.target_device_id
    }

    /// Capacity of the device at plan time. The engine requires the device
    /// to still report exactly this value when the session starts.
    pub fn target_capacity_bytes(&self) -> u64 {
        self.target_capacity_bytes
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn options(&self) -> WriteOptions {
        self.options
    }

    /// Total number of bytes the plan will put on the device.
    pub fn total_planned_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.length_bytes).sum()
    }
}

/// Builds [`WritePlan`]s from a source image, a target descriptor, and the
/// requested options.
#[derive(Clone, Debug, Default)]
pub struct ImagePlanner {
    config: PlannerConfig,
}

impl ImagePlanner {
    pub fn new() -> Self {
        ImagePlanner::default()
    }

    pub fn with_config(config: PlannerConfig) -> Self {
        ImagePlanner { config }
    }

    /// Builds a plan for writing `source_image` to `device`.
    ///
    /// `existing_layout` is consumed when `options.multi_boot` is set: the
    /// new image lands after the last occupied extent instead of at offset
    /// 0. Callers obtain it from [`ImagePlanner::scan_existing_layout`];
    /// for a fresh single-image write, pass an empty slice.
    pub fn build_plan(
        &self,
        source_image: &Path,
        device: &DeviceDescriptor,
        options: WriteOptions,
        existing_layout: &[Region],
    ) -> Result<WritePlan, PlanError> {
        let image_size = std::fs::metadata(source_image)
            .map_err(PlanError::SourceUnreadable)?
            .len();
        if image_size == 0 {
            return Err(PlanError::UnsupportedImage("source image is empty".into()));
        }

        let base = if options.multi_boot {
            let occupied_end = existing_layout
                .iter()
                .map(Region::end_bytes)
                .max()
                .unwrap_or(0);
            align_up(occupied_end, self.config.alignment_bytes)
        } else {
            0
        };

        let image_end = base + image_size;
        if image_end > device.capacity_bytes {
            return Err(PlanError::InsufficientCapacity {
                required: image_end,
                available: device.capacity_bytes,
            });
        }

        let mut regions = Vec::new();

        if options.boot_requirement_bypass {
            self.plan_patched_image(source_image, base, image_size, &mut regions)?;
        } else {
            regions.push(Region {
                offset_bytes: base,
                length_bytes: image_size,
                kind: SourceKind::RawImageCopy { source_offset: 0 },
                expected_digest: None,
            });
        }

        if options.persistence {
            self.plan_persistence(image_end, device.capacity_bytes, &mut regions)?;
        }

        self.fill_digests(source_image, &mut regions)?;

        debug_assert!(regions_disjoint_and_sorted(&regions));
        debug_assert!(regions.last().is_none_or(|r| r.end_bytes() <= device.capacity_bytes));

        log::debug!(
            "planned {} region(s), {} bytes total, for {}",
            regions.len(),
            regions.iter().map(|r| r.length_bytes).sum::<u64>(),
            device.id
        );

        Ok(WritePlan {
            source_image_path: source_image.to_path_buf(),
            source_image_size_bytes: image_size,
            target_device_id: device.id.clone(),
            target_capacity_bytes: device.capacity_bytes,
            regions,
            options,
        })
    }

    /// Reads the partition table off a device and returns its occupied
    /// extents, sorted by offset. Used as input for multi-boot planning.
    ///
    /// Only MBR tables are recognized; a device without one cannot host a
    /// multi-boot layout and yields [`PlanError::UnsupportedImage`].
    pub fn scan_existing_layout(
        &self,
        target: &mut dyn BlockTarget,
    ) -> Result<Vec<Region>, PlanError> {
        let mut sector = [0u8; 512];
        target
            .read_at(0, &mut sector)
            .map_err(PlanError::SourceUnreadable)?;

        if sector[510..512] != [0x55, 0xAA] {
            return Err(PlanError::UnsupportedImage(
                "device has no recognizable partition table".into(),
            ));
        }

        let mut extents = Vec::new();
        for i in 0..4 {
            let entry = &sector[MBR_PARTITION_TABLE_OFFSET + i * MBR_ENTRY_SIZE..]
                [..MBR_ENTRY_SIZE];
            let part_type = entry[4];
            let first_lba = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64;
            let sectors = u32::from_le_bytes(entry[12..16].try_into().unwrap()) as u64;
            if part_type == 0 || sectors == 0 {
                continue;
            }
            extents.push(Region {
                offset_bytes: first_lba * 512,
                length_bytes: sectors * 512,
                kind: SourceKind::RawImageCopy { source_offset: 0 },
                expected_digest: None,
            });
        }

        extents.sort_by_key(|r| r.offset_bytes);
        Ok(extents)
    }

    /// Plans the image copy with the boot-requirement bypass patch carved
    /// out of it, keeping all regions disjoint.
    fn plan_patched_image(
        &self,
        source_image: &Path,
        base: u64,
        image_size: u64,
        regions: &mut Vec<Region>,
    ) -> Result<(), PlanError> {
        match source::sniff_format(source_image)? {
            ImageFormat::Iso9660 => {}
            other => {
                return Err(PlanError::UnsupportedImage(format!(
                    "boot-requirement bypass needs an ISO 9660 image, got {other:?}"
                )));
            }
        }

        let patch_offset = base + source::ISO_PVD_OFFSET + PVD_APPLICATION_USE_OFFSET;
        let patch_len = BYPASS_PATCH_PAYLOAD.len() as u64;
        let patch_end = patch_offset + patch_len;

        regions.push(Region {
            offset_bytes: base,
            length_bytes: patch_offset - base,
            kind: SourceKind::RawImageCopy { source_offset: 0 },
            expected_digest: None,
        });
        regions.push(Region {
            offset_bytes: patch_offset,
            length_bytes: patch_len,
            kind: SourceKind::BootPatch {
                payload: BYPASS_PATCH_PAYLOAD.to_vec(),
            },
            expected_digest: None,
        });
        regions.push(Region {
            offset_bytes: patch_end,
            length_bytes: base + image_size - patch_end,
            kind: SourceKind::RawImageCopy {
                source_offset: patch_end - base,
            },
            expected_digest: None,
        });
        Ok(())
    }

    /// Appends the alignment gap and persistence regions after the image.
    ///
    /// Sizing policy: the partition starts at the next alignment boundary
    /// after the image and takes min(remaining capacity, configured
    /// ceiling), rounded down to the alignment. Deterministic for identical
    /// inputs.
    fn plan_persistence(
        &self,
        image_end: u64,
        capacity: u64,
        regions: &mut Vec<Region>,
    ) -> Result<(), PlanError> {
        let align = self.config.alignment_bytes;
        let start = align_up(image_end, align);
        let available = capacity.saturating_sub(start);
        let length = available.min(self.config.persistence_ceiling_bytes) / align * align;

        if length == 0 {
            return Err(PlanError::InsufficientCapacity {
                required: start + align,
                available: capacity,
            });
        }

        if start > image_end {
            regions.push(Region {
                offset_bytes: image_end,
                length_bytes: start - image_end,
                kind: SourceKind::ZeroFill,
                expected_digest: None,
            });
        }
        regions.push(Region {
            offset_bytes: start,
            length_bytes: length,
            kind: SourceKind::PersistencePartition,
            expected_digest: None,
        });
        Ok(())
    }

    /// Computes the SHA-256 of the source bytes behind every raw region,
    /// caching it in the plan so verification is a pure equality check.
    fn fill_digests(&self, source_image: &Path, regions: &mut [Region]) -> Result<(), PlanError> {
        let mut file = File::open(source_image).map_err(PlanError::SourceUnreadable)?;
        for region in regions {
            let SourceKind::RawImageCopy { source_offset } = region.kind else {
                continue;
            };
            let digest = digest_file_range(&mut file, source_offset, region.length_bytes)
                .map_err(PlanError::SourceUnreadable)?;
            region.expected_digest = Some(digest);
        }
        Ok(())
    }
}

/// SHA-256 of `length` bytes of `file` starting at `offset`.
fn digest_file_range(file: &mut File, offset: u64, length: u64) -> std::io::Result<[u8; 32]> {
    file.seek(SeekFrom::Start(offset))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut remaining = length;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        file.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;
    }
    Ok(hasher.finalize().into())
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn regions_disjoint_and_sorted(regions: &[Region]) -> bool {
    regions
        .windows(2)
        .all(|w| w[0].end_bytes() <= w[1].offset_bytes)
}
