// src/inode.rs
//
// Inodos en disco (UFS1 de 128 bytes, UFS2 de 256 bytes) y el recorrido de
// sus bloques directos e indirectos.

use crate::fs::{
    get_i16, get_i32, get_i64, get_u16, get_u32, howmany, put_i16, put_i32, put_i64, put_u16,
    put_u32, Daddr, Superblock, UfsVersion, NDADDR, NIADDR,
};

pub const UFS1_DINODE_SIZE: usize = 128;
pub const UFS2_DINODE_SIZE: usize = 256;

pub const IFMT: u16 = 0o170000;
pub const IFIFO: u16 = 0o010000;
pub const IFCHR: u16 = 0o020000;
pub const IFDIR: u16 = 0o040000;
pub const IFBLK: u16 = 0o060000;
pub const IFREG: u16 = 0o100000;
pub const IFLNK: u16 = 0o120000;
pub const IFSOCK: u16 = 0o140000;
pub const IFWHT: u16 = 0o160000;

/// Tipo de entrada de directorio (`DT_*`) derivado del modo.
pub fn iftodt(mode: u16) -> u8 {
    ((mode & IFMT) >> 12) as u8
}

/// Inodo canónico: ambos formatos se decodifican a esta vista.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dinode {
    pub mode: u16,
    pub nlink: i16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Bloques en unidades `DEV_BSIZE`.
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    pub gen: i32,
    pub db: [Daddr; NDADDR],
    pub ib: [Daddr; NIADDR],
}

impl Dinode {
    pub fn decode(version: UfsVersion, b: &[u8]) -> Self {
        let mut db = [0; NDADDR];
        let mut ib = [0; NIADDR];
        match version {
            UfsVersion::Ufs1 => {
                for (i, slot) in db.iter_mut().enumerate() {
                    *slot = i64::from(get_i32(b, 40 + 4 * i));
                }
                for (i, slot) in ib.iter_mut().enumerate() {
                    *slot = i64::from(get_i32(b, 88 + 4 * i));
                }
                Self {
                    mode: get_u16(b, 0),
                    nlink: get_i16(b, 2),
                    size: get_i64(b, 8) as u64,
                    atime: i64::from(get_i32(b, 16)),
                    mtime: i64::from(get_i32(b, 24)),
                    ctime: i64::from(get_i32(b, 32)),
                    db,
                    ib,
                    flags: get_u32(b, 100),
                    blocks: i64::from(get_i32(b, 104)),
                    gen: get_i32(b, 108),
                    uid: get_u32(b, 112),
                    gid: get_u32(b, 116),
                }
            }
            UfsVersion::Ufs2 => {
                for (i, slot) in db.iter_mut().enumerate() {
                    *slot = get_i64(b, 112 + 8 * i);
                }
                for (i, slot) in ib.iter_mut().enumerate() {
                    *slot = get_i64(b, 208 + 8 * i);
                }
                Self {
                    mode: get_u16(b, 0),
                    nlink: get_i16(b, 2),
                    uid: get_u32(b, 4),
                    gid: get_u32(b, 8),
                    size: get_i64(b, 16) as u64,
                    blocks: get_i64(b, 24),
                    atime: get_i64(b, 32),
                    mtime: get_i64(b, 40),
                    ctime: get_i64(b, 48),
                    gen: get_i32(b, 80),
                    flags: get_u32(b, 88),
                    db,
                    ib,
                }
            }
        }
    }

    /// Escribe los campos conocidos sobre `b`; el resto de bytes se conserva.
    pub fn encode(&self, version: UfsVersion, b: &mut [u8]) {
        put_u16(b, 0, self.mode);
        put_i16(b, 2, self.nlink);
        match version {
            UfsVersion::Ufs1 => {
                put_i64(b, 8, self.size as i64);
                put_i32(b, 16, self.atime as i32);
                put_i32(b, 24, self.mtime as i32);
                put_i32(b, 32, self.ctime as i32);
                for (i, d) in self.db.iter().enumerate() {
                    put_i32(b, 40 + 4 * i, *d as i32);
                }
                for (i, d) in self.ib.iter().enumerate() {
                    put_i32(b, 88 + 4 * i, *d as i32);
                }
                put_u32(b, 100, self.flags);
                put_i32(b, 104, self.blocks as i32);
                put_i32(b, 108, self.gen);
                put_u32(b, 112, self.uid);
                put_u32(b, 116, self.gid);
            }
            UfsVersion::Ufs2 => {
                put_u32(b, 4, self.uid);
                put_u32(b, 8, self.gid);
                put_i64(b, 16, self.size as i64);
                put_i64(b, 24, self.blocks);
                put_i64(b, 32, self.atime);
                put_i64(b, 40, self.mtime);
                put_i64(b, 48, self.ctime);
                put_i32(b, 80, self.gen);
                put_u32(b, 88, self.flags);
                for (i, d) in self.db.iter().enumerate() {
                    put_i64(b, 112 + 8 * i, *d);
                }
                for (i, d) in self.ib.iter().enumerate() {
                    put_i64(b, 208 + 8 * i, *d);
                }
            }
        }
    }

    pub fn file_type(&self) -> u16 {
        self.mode & IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == IFDIR
    }

    /// Sin modo pero con punteros o tamaño: inodo escrito a medias.
    pub fn is_partially_allocated(&self) -> bool {
        self.mode == 0
            && (self.size != 0
                || self.db.iter().any(|&d| d != 0)
                || self.ib.iter().any(|&d| d != 0))
    }

    /// Symlink cuyo destino vive dentro del arreglo de punteros.
    pub fn is_inline_symlink(&self, maxsymlinklen: i32) -> bool {
        self.file_type() == IFLNK
            && (self.size < maxsymlinklen.max(0) as u64 || (maxsymlinklen == 0 && self.blocks == 0))
    }
}

/// Tipos de archivo que un inodo asignado puede tener.
pub fn ftypeok(mode: u16) -> bool {
    matches!(
        mode & IFMT,
        IFDIR | IFREG | IFBLK | IFCHR | IFLNK | IFSOCK | IFIFO
    )
}

// -----------------------------------------------------------------------------
// Recorrido de bloques
// -----------------------------------------------------------------------------

/// Resultado de visitar un bloque. Se combinan con `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Visit(u8);

impl Visit {
    pub const KEEPON: Visit = Visit(0x01);
    pub const SKIP: Visit = Visit(0x02);
    pub const STOP: Visit = Visit(0x04);
    pub const ALTERED: Visit = Visit(0x08);
    pub const FOUND: Visit = Visit(0x10);

    pub fn has(self, other: Visit) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Visit {
    type Output = Visit;
    fn bitor(self, rhs: Visit) -> Visit {
        Visit(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Visit {
    fn bitor_assign(&mut self, rhs: Visit) {
        self.0 |= rhs.0;
    }
}

/// Un bloque alcanzable desde un inodo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub blkno: Daddr,
    /// Fragmentos que ocupa (el último bloque directo puede ser parcial).
    pub frags: i64,
    /// 0 para datos, 1..=3 para bloques indirectos.
    pub level: u8,
    /// Índice del bloque lógico (sólo significativo para datos directos).
    pub lbn: i64,
}

/// Parámetros de geometría que necesita el recorrido. Copiable para no
/// retener un préstamo del superblock mientras se visita.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub version: UfsVersion,
    pub bsize: i64,
    pub bshift: i32,
    pub fsize: i64,
    pub frag: i64,
    pub nindir: i64,
    pub maxsymlinklen: i32,
}

impl Geometry {
    pub fn of(sb: &Superblock) -> Self {
        Self {
            version: sb.version,
            bsize: i64::from(sb.bsize),
            bshift: sb.bshift,
            fsize: i64::from(sb.fsize),
            frag: i64::from(sb.frag),
            nindir: i64::from(sb.nindir),
            maxsymlinklen: sb.maxsymlinklen,
        }
    }

    pub fn ptr_size(&self) -> usize {
        match self.version {
            UfsVersion::Ufs1 => 4,
            UfsVersion::Ufs2 => 8,
        }
    }

    fn frags_of_last(&self, size: u64) -> i64 {
        let off = size as i64 & (self.bsize - 1);
        if off == 0 {
            self.frag
        } else {
            howmany(off, self.fsize)
        }
    }
}

/// Origen de los punteros de un bloque indirecto. `None` indica que el bloque
/// no debe recorrerse (fuera de rango).
pub trait IndirectSource {
    type Error;
    fn indirect_block(&mut self, blk: Daddr) -> Result<Option<Vec<u8>>, Self::Error>;

    /// El bloque indirecto `blk` tiene punteros distintos de cero desde la
    /// posición `from`, más allá del tamaño del archivo.
    fn stray_pointers(&mut self, _blk: Daddr, _from: usize) -> Result<(), Self::Error> {
        Ok(())
    }
}

fn indirect_ptr(geo: &Geometry, buf: &[u8], i: usize) -> Daddr {
    match geo.version {
        UfsVersion::Ufs1 => i64::from(get_i32(buf, 4 * i)),
        UfsVersion::Ufs2 => get_i64(buf, 8 * i),
    }
}

/// Recorre cada bloque alcanzable desde `dp`: primero los directos, luego los
/// indirectos. Cada bloque indirecto se visita antes de descender y sólo se
/// desciende si la visita devuelve `KEEPON`. Devuelve la visita que detuvo el
/// recorrido, o `KEEPON`.
pub fn walk_blocks<C, F>(ctx: &mut C, geo: Geometry, dp: &Dinode, mut visit: F) -> Result<Visit, C::Error>
where
    C: IndirectSource,
    F: FnMut(&mut C, &BlockRef) -> Result<Visit, C::Error>,
{
    let ft = dp.file_type();
    if ft == IFBLK || ft == IFCHR || dp.is_inline_symlink(geo.maxsymlinklen) {
        return Ok(Visit::KEEPON);
    }

    let mut ndb = howmany(dp.size as i64, geo.bsize);
    for (i, &blk) in dp.db.iter().enumerate() {
        ndb -= 1;
        let frags = if ndb == 0 { geo.frags_of_last(dp.size) } else { geo.frag };
        if blk == 0 {
            continue;
        }
        let bref = BlockRef {
            blkno: blk,
            frags,
            level: 0,
            lbn: i as i64,
        };
        let ret = visit(ctx, &bref)?;
        if ret.has(Visit::STOP) {
            return Ok(ret);
        }
    }

    let mut remsize = dp.size as i64 - geo.bsize * NDADDR as i64;
    let mut sizepb = geo.bsize;
    for (i, &blk) in dp.ib.iter().enumerate() {
        if blk != 0 {
            let ret = walk_indirect(ctx, &geo, blk, i as u8 + 1, remsize, &mut visit)?;
            if ret.has(Visit::STOP) {
                return Ok(ret);
            }
        }
        sizepb = sizepb.saturating_mul(geo.nindir);
        remsize = remsize.saturating_sub(sizepb);
    }
    Ok(Visit::KEEPON)
}

fn walk_indirect<C, F>(
    ctx: &mut C,
    geo: &Geometry,
    blk: Daddr,
    level: u8,
    isize: i64,
    visit: &mut F,
) -> Result<Visit, C::Error>
where
    C: IndirectSource,
    F: FnMut(&mut C, &BlockRef) -> Result<Visit, C::Error>,
{
    let bref = BlockRef {
        blkno: blk,
        frags: geo.frag,
        level,
        lbn: -1,
    };
    let ret = visit(ctx, &bref)?;
    if !ret.has(Visit::KEEPON) {
        return Ok(ret);
    }
    let Some(buf) = ctx.indirect_block(blk)? else {
        return Ok(Visit::SKIP);
    };

    // Bytes cubiertos por cada puntero de este nivel.
    let mut sizepb = geo.bsize;
    for _ in 1..level {
        sizepb = sizepb.saturating_mul(geo.nindir);
    }
    let nif = if isize > sizepb.saturating_mul(geo.nindir) {
        geo.nindir
    } else {
        howmany(isize.max(0), sizepb)
    };
    let nptr = buf.len() / geo.ptr_size();
    let nif = (nif.max(0) as usize).min(nptr);
    if (nif..nptr).any(|i| indirect_ptr(geo, &buf, i) != 0) {
        ctx.stray_pointers(blk, nif)?;
    }

    let mut remaining = isize;
    for i in 0..nif {
        let child = indirect_ptr(geo, &buf, i);
        if child != 0 {
            let ret = if level == 1 {
                visit(
                    ctx,
                    &BlockRef {
                        blkno: child,
                        frags: geo.frag,
                        level: 0,
                        lbn: -1,
                    },
                )?
            } else {
                walk_indirect(ctx, geo, child, level - 1, remaining, visit)?
            };
            if ret.has(Visit::STOP) {
                return Ok(ret);
            }
        }
        remaining -= sizepb;
    }
    Ok(Visit::KEEPON)
}

/// Bloques lógicos que implica el tamaño declarado, para la comprobación de
/// punteros basura. `None` si el número no es representable.
pub fn declared_blocks(dp: &Dinode, geo: &Geometry) -> Option<i64> {
    let size = i64::try_from(dp.size).ok()?;
    let mut ndb = howmany(size, geo.bsize);
    if ndb < 0 {
        return None;
    }
    let ft = dp.file_type();
    if ft == IFBLK || ft == IFCHR {
        ndb += 1;
    }
    if ft == IFLNK && dp.blocks == 0 && (size < i64::from(geo.maxsymlinklen) || geo.maxsymlinklen == 0) {
        // El destino vive en el arreglo de punteros: el tamaño cuenta
        // unidades del tamaño de un puntero.
        ndb = howmany(size, geo.ptr_size() as i64);
        if ndb > NDADDR as i64 {
            let mut j = ndb - NDADDR as i64;
            ndb = 1;
            while j > 1 {
                ndb = ndb.saturating_mul(geo.nindir);
                j -= 1;
            }
            ndb += NDADDR as i64;
        }
    }
    Some(ndb)
}

/// Primer puntero no nulo más allá de lo que implica el tamaño declarado.
pub fn garbage_beyond_size(dp: &Dinode, geo: &Geometry, ndb: i64) -> Option<&'static str> {
    for j in ndb.max(0) as usize..NDADDR {
        if dp.db[j] != 0 {
            return Some("direct");
        }
    }
    let mut j = 0usize;
    let mut rest = ndb - NDADDR as i64;
    while rest > 0 {
        rest /= geo.nindir.max(1);
        j += 1;
    }
    for k in j..NIADDR {
        if dp.ib[k] != 0 {
            return Some("indirect");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn geo(version: UfsVersion) -> Geometry {
        Geometry {
            version,
            bsize: 4096,
            bshift: 12,
            fsize: 1024,
            frag: 4,
            nindir: 4096 / if version == UfsVersion::Ufs1 { 4 } else { 8 },
            maxsymlinklen: if version == UfsVersion::Ufs1 { 60 } else { 120 },
        }
    }

    /// Bloques indirectos en memoria; anota los avisos de punteros sueltos.
    struct Blocks(HashMap<Daddr, Vec<u8>>, Vec<(Daddr, usize)>);

    impl IndirectSource for Blocks {
        type Error = ();
        fn indirect_block(&mut self, blk: Daddr) -> Result<Option<Vec<u8>>, ()> {
            Ok(self.0.get(&blk).cloned())
        }

        fn stray_pointers(&mut self, blk: Daddr, from: usize) -> Result<(), ()> {
            self.1.push((blk, from));
            Ok(())
        }
    }

    #[test]
    fn ufs1_and_ufs2_decode_the_same_inode() {
        let mut dp = Dinode {
            mode: IFREG | 0o644,
            nlink: 1,
            size: 5000,
            blocks: 16,
            ..Dinode::default()
        };
        dp.db[0] = 100;
        dp.db[1] = 104;
        dp.ib[0] = 200;
        for version in [UfsVersion::Ufs1, UfsVersion::Ufs2] {
            let mut raw = vec![0u8; UFS2_DINODE_SIZE];
            dp.encode(version, &mut raw);
            assert_eq!(Dinode::decode(version, &raw), dp);
        }
    }

    #[test]
    fn last_direct_block_is_partial() {
        let mut dp = Dinode {
            mode: IFREG,
            size: 4096 + 1500,
            ..Dinode::default()
        };
        dp.db[0] = 8;
        dp.db[1] = 12;
        let mut seen = Vec::new();
        let mut src = Blocks(HashMap::new(), Vec::new());
        walk_blocks(&mut src, geo(UfsVersion::Ufs1), &dp, |_, b| {
            seen.push((b.blkno, b.frags));
            Ok(Visit::KEEPON)
        })
        .unwrap();
        assert_eq!(seen, vec![(8, 4), (12, 2)]);
    }

    #[test]
    fn indirect_block_is_visited_before_its_children() {
        let g = geo(UfsVersion::Ufs2);
        let mut dp = Dinode {
            mode: IFREG,
            size: (4096 * (NDADDR as u64 + 2)),
            ..Dinode::default()
        };
        for (i, d) in dp.db.iter_mut().enumerate() {
            *d = 100 + 4 * i as i64;
        }
        dp.ib[0] = 500;
        let mut ind = vec![0u8; 4096];
        put_i64(&mut ind, 0, 600);
        put_i64(&mut ind, 8, 604);
        // Más allá del tamaño: no debe visitarse.
        put_i64(&mut ind, 16, 608);
        let mut src = Blocks(HashMap::from([(500, ind)]), Vec::new());
        let mut seen = Vec::new();
        walk_blocks(&mut src, g, &dp, |_, b| {
            seen.push((b.blkno, b.level));
            Ok(Visit::KEEPON)
        })
        .unwrap();
        assert_eq!(&seen[NDADDR..], &[(500, 1), (600, 0), (604, 0)]);
        assert_eq!(src.1, vec![(500, 2)]);
    }

    #[test]
    fn fully_used_indirect_block_has_no_strays() {
        let g = geo(UfsVersion::Ufs1);
        let nindir = g.nindir as u64;
        let mut dp = Dinode {
            mode: IFREG,
            size: 4096 * (NDADDR as u64 + nindir),
            ..Dinode::default()
        };
        dp.ib[0] = 500;
        let mut ind = vec![0u8; 4096];
        put_i32(&mut ind, 4 * (nindir as usize - 1), 900);
        let mut src = Blocks(HashMap::from([(500, ind)]), Vec::new());
        let mut seen = Vec::new();
        walk_blocks(&mut src, g, &dp, |_, b| {
            seen.push(b.blkno);
            Ok(Visit::KEEPON)
        })
        .unwrap();
        assert_eq!(seen, vec![500, 900]);
        assert!(src.1.is_empty());
    }

    #[test]
    fn inline_symlink_reinterprets_size() {
        let g = geo(UfsVersion::Ufs1);
        let dp = Dinode {
            mode: IFLNK,
            size: 20,
            ..Dinode::default()
        };
        // 20 bytes en punteros de 4 bytes: 5 ranuras.
        assert_eq!(declared_blocks(&dp, &g), Some(5));
        let mut bad = dp.clone();
        bad.db[7] = 1;
        assert_eq!(garbage_beyond_size(&bad, &g, 5), Some("direct"));
        assert_eq!(garbage_beyond_size(&dp, &g, 5), None);
    }

    #[test]
    fn garbage_indirect_pointer_is_found() {
        let g = geo(UfsVersion::Ufs1);
        let mut dp = Dinode {
            mode: IFREG,
            size: 4096,
            ..Dinode::default()
        };
        dp.db[0] = 40;
        dp.ib[1] = 99;
        let ndb = declared_blocks(&dp, &g).unwrap();
        assert_eq!(garbage_beyond_size(&dp, &g, ndb), Some("indirect"));
    }
}
