//! Local image files.
//!
//! A `localimage` source may be a SIF container, a bare squashfs or ext3
//! filesystem image, or a sandbox directory. The kind is decided by the
//! file's magic bytes.

pub mod sif;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sbuild_core::error::{BuildError, Result};

pub use sif::{SifImage, OCI_CONFIG_DESCRIPTOR};

const SQUASHFS_MAGIC: &[u8] = b"hsqs";
const EXT3_MAGIC_OFFSET: u64 = 1080;
const EXT3_MAGIC: u16 = 0xEF53;

/// Kind of a local image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalImageKind {
    Sif,
    Squashfs,
    Ext3,
    Sandbox,
}

/// Identify the image at `path`.
pub fn sniff(path: &Path) -> Result<LocalImageKind> {
    let meta = std::fs::metadata(path).map_err(|e| {
        BuildError::Config(format!("Local image {} is not accessible: {}", path.display(), e))
    })?;
    if meta.is_dir() {
        return Ok(LocalImageKind::Sandbox);
    }

    let mut file = File::open(path)?;
    let mut head = [0u8; 64];
    let n = read_up_to(&mut file, &mut head)?;
    let head = &head[..n];

    let magic_at = sif::SIF_MAGIC_OFFSET as usize;
    if head.len() >= magic_at + sif::SIF_MAGIC.len()
        && &head[magic_at..magic_at + sif::SIF_MAGIC.len()] == sif::SIF_MAGIC
    {
        return Ok(LocalImageKind::Sif);
    }
    if head.starts_with(SQUASHFS_MAGIC) {
        return Ok(LocalImageKind::Squashfs);
    }

    if meta.len() >= EXT3_MAGIC_OFFSET + 2 {
        let mut magic = [0u8; 2];
        file.seek(SeekFrom::Start(EXT3_MAGIC_OFFSET))?;
        file.read_exact(&mut magic)?;
        if u16::from_le_bytes(magic) == EXT3_MAGIC {
            return Ok(LocalImageKind::Ext3);
        }
    }

    Err(BuildError::Config(format!(
        "{} is not a SIF, squashfs, ext3 image or sandbox directory",
        path.display()
    )))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sniff_kinds() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(sniff(tmp.path()).unwrap(), LocalImageKind::Sandbox);

        let squash = tmp.path().join("fs.sqfs");
        let mut data = b"hsqs".to_vec();
        data.resize(4096, 0);
        std::fs::write(&squash, &data).unwrap();
        assert_eq!(sniff(&squash).unwrap(), LocalImageKind::Squashfs);

        let ext3 = tmp.path().join("fs.img");
        let mut data = vec![0u8; 2048];
        data[1080..1082].copy_from_slice(&0xEF53u16.to_le_bytes());
        std::fs::write(&ext3, &data).unwrap();
        assert_eq!(sniff(&ext3).unwrap(), LocalImageKind::Ext3);

        let sif_path = tmp.path().join("c.sif");
        sif::write_sif(&sif_path, &[]).unwrap();
        assert_eq!(sniff(&sif_path).unwrap(), LocalImageKind::Sif);

        let junk = tmp.path().join("junk");
        std::fs::write(&junk, b"nothing").unwrap();
        assert!(sniff(&junk).is_err());
        assert!(sniff(&tmp.path().join("missing")).is_err());
    }
}
