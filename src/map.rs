// SPDX-License-Identifier: GPL-3.0-only

//! Remap map file loading
//!
//! File layout, all little-endian:
//!
//! ```text
//! i32 video_width
//! i32 video_height
//! i32 camera_width
//! i32 camera_height
//! u32 entries[video_width * video_height]
//! ```
//!
//! Entries are opaque to the CPU side; the kernel decodes them.

use crate::constants::map::{ENTRY_SIZE, HEADER_LEN};
use crate::errors::{PipelineError, PipelineResult, Stage};
use crate::geometry::FrameGeometry;
use crate::memory::{SharedBuffer, SharedMemory, read_fully};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub video_width: u32,
    pub video_height: u32,
    pub camera_width: u32,
    pub camera_height: u32,
}

impl MapHeader {
    pub fn read<R: Read>(reader: &mut R) -> PipelineResult<Self> {
        let mut bytes = [0u8; HEADER_LEN];
        let filled = read_fully(reader, &mut bytes).map_err(|e| PipelineError::io(Stage::Map, e))?;
        if filled != HEADER_LEN {
            return Err(PipelineError::ShortRead {
                expected: HEADER_LEN,
                actual: filled,
            });
        }

        let mut fields = [0u32; 4];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(4)) {
            let value = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            *field = u32::try_from(value).map_err(|_| {
                PipelineError::InvalidGeometry(format!("negative dimension {} in map header", value))
            })?;
        }

        Ok(Self {
            video_width: fields[0],
            video_height: fields[1],
            camera_width: fields[2],
            camera_height: fields[3],
        })
    }

    pub fn geometry(&self) -> PipelineResult<FrameGeometry> {
        FrameGeometry::new(
            self.video_width,
            self.video_height,
            self.camera_width,
            self.camera_height,
        )
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        let fields = [
            self.video_width,
            self.video_height,
            self.camera_width,
            self.camera_height,
        ];
        for (chunk, field) in bytes.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&(field as i32).to_le_bytes());
        }
        bytes
    }
}

/// Coordinate table resident in shared memory, read-only once loaded
pub struct RemapTable {
    buffer: SharedBuffer,
    entries: usize,
}

impl RemapTable {
    /// Read one entry per output pixel of `geometry` from `reader`
    pub fn load<R: Read>(
        domain: &Arc<dyn SharedMemory>,
        reader: &mut R,
        geometry: &FrameGeometry,
    ) -> PipelineResult<Self> {
        let entries = geometry.map_entries();
        let size = entries * ENTRY_SIZE;
        let mut buffer = SharedBuffer::create(domain, size)?;
        buffer.load(reader, size)?;
        Ok(Self { buffer, entries })
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn device_address(&self) -> u32 {
        self.buffer.device_address()
    }
}

impl std::fmt::Debug for RemapTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapTable")
            .field("entries", &self.entries)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// Read the header, validate the geometry, then load the table
pub fn open_map(
    path: &Path,
    domain: &Arc<dyn SharedMemory>,
) -> PipelineResult<(FrameGeometry, RemapTable)> {
    let file = File::open(path).map_err(|e| {
        PipelineError::setup(Stage::Map, format!("failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let header = MapHeader::read(&mut reader)?;
    let geometry = header.geometry()?;
    info!(
        path = %path.display(),
        video = format_args!("{}x{}", geometry.video_width, geometry.video_height),
        camera = format_args!("{}x{}", geometry.camera_width, geometry.camera_height),
        "Loading remap map"
    );

    let table = RemapTable::load(domain, &mut reader, &geometry)?;
    Ok((geometry, table))
}
