/*Dispositivo en memoria para pruebas. Cuenta las escrituras y permite
inyectar fallos de lectura o escritura en rangos de bytes, para revisar
qué hace el fsck cuando el disco falla a medio camino*/

use std::io;
use std::ops::Range;

use anyhow::{anyhow, Result};

use crate::fs::{Daddr, Ino, Superblock, UfsVersion, SBLOCKSIZE, SBLOCK_UFS1, SBLOCK_UFS2};
use crate::inode::Dinode;
use crate::mkfs::{build_image, put_inode, MkfsParams};

use super::fsck_backend::Device;

#[derive(Debug, Clone, Default)]
pub struct MemDevice {
    pub data: Vec<u8>,
    /// Llamadas a write_at que llegaron al "disco".
    pub writes: usize,
    pub fail_reads: Vec<Range<u64>>,
    pub fail_writes: Vec<Range<u64>>,
    pub readonly: bool,
}

impl MemDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn fail_reads_in(&mut self, r: Range<u64>) {
        self.fail_reads.push(r);
    }

    pub fn fail_writes_in(&mut self, r: Range<u64>) {
        self.fail_writes.push(r);
    }

    pub fn clear_failures(&mut self) {
        self.fail_reads.clear();
        self.fail_writes.clear();
    }

    fn hits(ranges: &[Range<u64>], offset: u64, len: usize) -> bool {
        let end = offset + len as u64;
        ranges.iter().any(|r| offset < r.end && r.start < end)
    }

    fn bounds(&self, offset: u64, len: usize) -> io::Result<Range<usize>> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("acceso fuera del dispositivo: {offset}+{len}"),
            ));
        }
        Ok(start..end)
    }
}

impl Device for MemDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if Self::hits(&self.fail_reads, offset, buf.len()) {
            return Err(io::Error::other("fallo de lectura inyectado"));
        }
        let r = self.bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.readonly {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "solo lectura"));
        }
        if Self::hits(&self.fail_writes, offset, buf.len()) {
            return Err(io::Error::other("fallo de escritura inyectado"));
        }
        let r = self.bounds(offset, buf.len())?;
        self.data[r].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}

/// Imagen recién formateada con su superbloque, para corromperla a mano
/// antes de pasarle el fsck.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub img: Vec<u8>,
    pub sb: Superblock,
}

impl TestImage {
    pub fn new(p: &MkfsParams) -> Result<Self> {
        let img = build_image(p)?;
        let at = match p.version {
            UfsVersion::Ufs1 => SBLOCK_UFS1,
            UfsVersion::Ufs2 => SBLOCK_UFS2,
        } as usize;
        let raw = img
            .get(at..at + SBLOCKSIZE)
            .ok_or_else(|| anyhow!("imagen demasiado corta"))?;
        let sb = Superblock::decode(raw)?;
        Ok(Self { img, sb })
    }

    pub fn inode(&self, ino: Ino) -> Dinode {
        let isize = self.sb.inode_size();
        let at = self.sb.byte_offset(self.sb.ino_to_fsba(ino)) as usize + self.sb.ino_to_fsbo(ino) * isize;
        Dinode::decode(self.sb.version, &self.img[at..at + isize])
    }

    pub fn put_inode(&mut self, ino: Ino, dp: &Dinode) {
        put_inode(&mut self.img, &self.sb, ino, dp);
    }

    /// Bytes del fragmento `blk`.
    pub fn frag_mut(&mut self, blk: Daddr) -> &mut [u8] {
        let at = self.sb.byte_offset(blk) as usize;
        let fsize = self.sb.fsize as usize;
        &mut self.img[at..at + fsize]
    }

    pub fn device(self) -> MemDevice {
        MemDevice::new(self.img)
    }
}
