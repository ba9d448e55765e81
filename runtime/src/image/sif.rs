//! Minimal SIF (v2) reader.
//!
//! Reads the global header and the descriptor table, which is all the build
//! pipeline needs: the primary system partition, the OCI config JSON
//! object and the signature descriptors.
//!
//! ```text
//! 0     launch script   [32]
//! 32    magic "SIF_MAGIC" [10]
//! 42    version [3], arch [3], id [16]
//! 64    ctime, mtime, dfree, dtotal, descoff, desclen, dataoff, datalen (i64 LE)
//! 128   end of header
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sbuild_core::error::{BuildError, Result};

/// Magic at offset 32 of every SIF file.
pub const SIF_MAGIC: &[u8] = b"SIF_MAGIC";
pub const SIF_MAGIC_OFFSET: u64 = 32;

/// Name of the descriptor holding the image's OCI config.
pub const OCI_CONFIG_DESCRIPTOR: &str = "oci-config.json";

const HEADER_SIZE: usize = 128;
const DESCRIPTOR_SIZE: usize = 585;
const NAME_LEN: usize = 128;
const EXTRA_LEN: usize = 384;
const ENTITY_LEN: usize = 20;

/// Descriptor data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Deffile,
    EnvVar,
    Labels,
    Partition,
    Signature,
    GenericJson,
    Generic,
    Other(i32),
}

impl DataType {
    fn from_raw(raw: i32) -> Self {
        match raw {
            0x4001 => DataType::Deffile,
            0x4002 => DataType::EnvVar,
            0x4003 => DataType::Labels,
            0x4004 => DataType::Partition,
            0x4005 => DataType::Signature,
            0x4006 => DataType::GenericJson,
            0x4007 => DataType::Generic,
            other => DataType::Other(other),
        }
    }

    fn to_raw(self) -> i32 {
        match self {
            DataType::Deffile => 0x4001,
            DataType::EnvVar => 0x4002,
            DataType::Labels => 0x4003,
            DataType::Partition => 0x4004,
            DataType::Signature => 0x4005,
            DataType::GenericJson => 0x4006,
            DataType::Generic => 0x4007,
            DataType::Other(raw) => raw,
        }
    }
}

/// Filesystem of a partition descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Squashfs,
    Ext3,
    ImmutableObject,
    Raw,
    EncryptedSquashfs,
    Unknown(i32),
}

impl FsType {
    fn from_raw(raw: i32) -> Self {
        match raw {
            1 => FsType::Squashfs,
            2 => FsType::Ext3,
            3 => FsType::ImmutableObject,
            4 => FsType::Raw,
            5 => FsType::EncryptedSquashfs,
            other => FsType::Unknown(other),
        }
    }
}

const PART_PRIMARY_SYSTEM: i32 = 2;

/// One entry of the descriptor table.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub data_type: DataType,
    pub used: bool,
    pub id: u32,
    pub group_id: u32,
    pub link_id: u32,
    /// Offset of the data in the file
    pub offset: u64,
    pub size: u64,
    pub name: String,
    extra: Vec<u8>,
}

impl Descriptor {
    pub fn fs_type(&self) -> Option<FsType> {
        (self.data_type == DataType::Partition).then(|| FsType::from_raw(read_i32(&self.extra, 0)))
    }

    pub fn is_primary_partition(&self) -> bool {
        self.data_type == DataType::Partition && read_i32(&self.extra, 4) == PART_PRIMARY_SYSTEM
    }

    /// Fingerprint of the key that made a signature, as upper-case hex.
    pub fn signing_entity(&self) -> Option<String> {
        if self.data_type != DataType::Signature {
            return None;
        }
        let entity = self.extra.get(4..4 + ENTITY_LEN)?;
        if entity.iter().all(|b| *b == 0) {
            return None;
        }
        Some(hex::encode_upper(entity))
    }
}

/// An opened SIF file.
#[derive(Debug)]
pub struct SifImage {
    path: PathBuf,
    descriptors: Vec<Descriptor>,
}

impl SifImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| {
            BuildError::Other(format!("Failed to open SIF {}: {}", path.display(), e))
        })?;

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header).map_err(|e| {
            BuildError::Other(format!("Failed to read SIF header of {}: {}", path.display(), e))
        })?;
        if &header[32..32 + SIF_MAGIC.len()] != SIF_MAGIC {
            return Err(BuildError::Other(format!("{} is not a SIF file", path.display())));
        }

        let dtotal = read_i64(&header, 88);
        let descoff = read_i64(&header, 96);
        if dtotal < 0 || descoff < HEADER_SIZE as i64 || dtotal > 1 << 20 {
            return Err(BuildError::Other(format!(
                "Corrupt SIF header in {}",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(descoff as u64))?;
        let mut descriptors = Vec::new();
        let mut raw = vec![0u8; DESCRIPTOR_SIZE];
        for _ in 0..dtotal {
            file.read_exact(&mut raw).map_err(|e| {
                BuildError::Other(format!(
                    "Failed to read SIF descriptors of {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let descriptor = parse_descriptor(&raw);
            if descriptor.used {
                descriptors.push(descriptor);
            }
        }

        Ok(Self { path, descriptors })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// The primary system partition, holding the root filesystem.
    pub fn primary_partition(&self) -> Result<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.is_primary_partition())
            .ok_or_else(|| {
                BuildError::Other(format!(
                    "No primary system partition in {}",
                    self.path.display()
                ))
            })
    }

    pub fn signatures(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.data_type == DataType::Signature)
    }

    /// Contents of the generic JSON descriptor called `name`, if present.
    pub fn json_object(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self
            .descriptors
            .iter()
            .find(|d| d.data_type == DataType::GenericJson && d.name == name)
        {
            Some(d) => self.read_data(d).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_data(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(descriptor.size as usize);
        self.data_reader(descriptor)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// A reader over one descriptor's data.
    pub fn data_reader(&self, descriptor: &Descriptor) -> Result<io::Take<File>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(descriptor.offset))?;
        Ok(file.take(descriptor.size))
    }
}

fn parse_descriptor(raw: &[u8]) -> Descriptor {
    let name_bytes = &raw[73..73 + NAME_LEN];
    let name_end = name_bytes.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    Descriptor {
        data_type: DataType::from_raw(read_i32(raw, 0)),
        used: raw[4] != 0,
        id: read_u32(raw, 5),
        group_id: read_u32(raw, 9),
        link_id: read_u32(raw, 13),
        offset: read_i64(raw, 17).max(0) as u64,
        size: read_i64(raw, 25).max(0) as u64,
        name: String::from_utf8_lossy(&name_bytes[..name_end]).into_owned(),
        extra: raw[73 + NAME_LEN..73 + NAME_LEN + EXTRA_LEN].to_vec(),
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map_or(0, i32::from_le_bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map_or(0, u32::from_le_bytes)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    buf.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map_or(0, i64::from_le_bytes)
}

/// Descriptor contents for [`write_sif`].
#[derive(Debug, Clone)]
pub struct DescriptorInput {
    pub data_type: DataType,
    pub name: String,
    /// Leading bytes of the type-specific `extra` area
    pub extra: Vec<u8>,
    pub data: Vec<u8>,
}

impl DescriptorInput {
    /// Primary system partition of the given filesystem type.
    pub fn partition(fs: FsType, data: Vec<u8>) -> Self {
        let fs_raw: i32 = match fs {
            FsType::Squashfs => 1,
            FsType::Ext3 => 2,
            FsType::ImmutableObject => 3,
            FsType::Raw => 4,
            FsType::EncryptedSquashfs => 5,
            FsType::Unknown(raw) => raw,
        };
        let mut extra = Vec::new();
        extra.extend_from_slice(&fs_raw.to_le_bytes());
        extra.extend_from_slice(&PART_PRIMARY_SYSTEM.to_le_bytes());
        Self {
            data_type: DataType::Partition,
            name: String::new(),
            extra,
            data,
        }
    }

    pub fn json(name: &str, data: Vec<u8>) -> Self {
        Self {
            data_type: DataType::GenericJson,
            name: name.to_string(),
            extra: Vec::new(),
            data,
        }
    }

    /// Signature by the key with the 20-byte `fingerprint`.
    pub fn signature(fingerprint: [u8; ENTITY_LEN], data: Vec<u8>) -> Self {
        let mut extra = Vec::new();
        extra.extend_from_slice(&8i32.to_le_bytes());
        extra.extend_from_slice(&fingerprint);
        Self {
            data_type: DataType::Signature,
            name: String::new(),
            extra,
            data,
        }
    }
}

/// Write a SIF file holding `descriptors`. Used to assemble images in
/// tests and by callers that repackage a single partition.
pub fn write_sif(path: &Path, descriptors: &[DescriptorInput]) -> Result<()> {
    let descoff = HEADER_SIZE as i64;
    let desclen = (DESCRIPTOR_SIZE * descriptors.len()) as i64;
    let dataoff = descoff + desclen;
    let datalen: i64 = descriptors.iter().map(|d| d.data.len() as i64).sum();
    let now = chrono::Utc::now().timestamp();

    let mut out = Vec::with_capacity((dataoff + datalen) as usize);
    let mut launch = b"#!/usr/bin/env run-singularity\n".to_vec();
    launch.resize(32, 0);
    out.extend_from_slice(&launch);
    let mut magic = SIF_MAGIC.to_vec();
    magic.resize(10, 0);
    out.extend_from_slice(&magic);
    out.extend_from_slice(b"02\0");
    out.extend_from_slice(b"00\0");
    out.extend_from_slice(&[0u8; 16]);
    for value in [now, now, 0, descriptors.len() as i64, descoff, desclen, dataoff, datalen] {
        out.extend_from_slice(&value.to_le_bytes());
    }

    let mut offset = dataoff;
    for (index, d) in descriptors.iter().enumerate() {
        let mut raw = Vec::with_capacity(DESCRIPTOR_SIZE);
        raw.extend_from_slice(&d.data_type.to_raw().to_le_bytes());
        raw.push(1);
        raw.extend_from_slice(&(index as u32 + 1).to_le_bytes());
        raw.extend_from_slice(&0xf000_0001u32.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        let size = d.data.len() as i64;
        for value in [offset, size, size, now, now, 0, 0] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        let mut name = d.name.as_bytes().to_vec();
        name.resize(NAME_LEN, 0);
        raw.extend_from_slice(&name);
        let mut extra = d.extra.clone();
        extra.resize(EXTRA_LEN, 0);
        raw.extend_from_slice(&extra);
        out.extend_from_slice(&raw);
        offset += size;
    }
    for d in descriptors {
        out.extend_from_slice(&d.data);
    }

    std::fs::write(path, out)
        .map_err(|e| BuildError::Other(format!("Failed to write SIF {}: {}", path.display(), e)))
}
