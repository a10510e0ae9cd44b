// src/mkfs.rs
//
// Formateo de imágenes UFS1/UFS2 en memoria. Lo usan el binario mkfs.ffs y
// las pruebas: la imagen resultante es consistente (fsck no encuentra nada
// que corregir) y contiene el directorio raíz y un lost+found vacío.

use anyhow::{anyhow, Result};

use crate::cg::{cg_header_size, setbit, CgFormat, CylinderGroup};
use crate::dir::{dirsiz, DirFormat, DIRBLKSIZ, DT_DIR};
use crate::fs::{
    howmany, max_file_size, CsumTotal, Daddr, Ino, Superblock, UfsVersion, CSUM_SIZE, DEV_BSIZE,
    FS_42INODEFMT, FS_42POSTBLFMT, FS_44INODEFMT, FS_DYNAMICPOSTBLFMT, FS_FLAGS_UPDATED, FS_ISCLEAN,
    MAXBSIZE, MAXCPG_STATIC, MAXFRAG, MINBSIZE, NDADDR, NIADDR, NRPOS, ROOTINO, SBLOCKSIZE, SBLOCK_UFS1,
    SBLOCK_UFS2,
};
use crate::inode::{Dinode, IFDIR};

/// Inodo de lost+found en una imagen recién formateada.
pub const LOSTFOUNDINO: Ino = ROOTINO + 1;

const NSECT: i32 = 32;
const NTRAK: i32 = 4;

#[derive(Debug, Clone)]
pub struct MkfsParams {
    pub version: UfsVersion,
    pub cg_format: CgFormat,
    pub bsize: i32,
    pub fsize: i32,
    pub ncg: i32,
    /// Fragmentos por grupo.
    pub fpg: i32,
    /// Inodos por grupo.
    pub ipg: i32,
    pub contigsumsize: i32,
    pub time: i64,
}

impl Default for MkfsParams {
    fn default() -> Self {
        Self {
            version: UfsVersion::Ufs2,
            cg_format: CgFormat::Dynamic,
            bsize: 8192,
            fsize: 1024,
            ncg: 2,
            fpg: 2048,
            ipg: 256,
            contigsumsize: 4,
            time: 0,
        }
    }
}

impl MkfsParams {
    pub fn ufs2() -> Self {
        Self::default()
    }

    /// UFS1 con grupos autodescriptivos y campos de 64 bits al día.
    pub fn ufs1_dynamic() -> Self {
        Self {
            version: UfsVersion::Ufs1,
            contigsumsize: 0,
            ..Self::default()
        }
    }

    /// UFS1 heredado: grupos estáticos, formato de inodos y directorios
    /// anterior a 4.4.
    pub fn ufs1_static() -> Self {
        Self {
            version: UfsVersion::Ufs1,
            cg_format: CgFormat::Static,
            contigsumsize: 0,
            ..Self::default()
        }
    }
}

/// Disposición calculada de cada grupo, en fragmentos relativos al inicio del
/// grupo.
#[derive(Debug, Clone, Copy)]
struct FsLayout {
    sblockloc: u64,
    sblkno: i32,
    cblkno: i32,
    iblkno: i32,
    dblkno: i32,
    cpg: i32,
}

fn log2(v: i32) -> i32 {
    v.trailing_zeros() as i32
}

fn roundup(x: i64, y: i64) -> i64 {
    howmany(x, y) * y
}

/// Cálculo del layout y validación de parámetros.
fn build_layout(p: &MkfsParams) -> Result<FsLayout> {
    if p.bsize < MINBSIZE || p.bsize > MAXBSIZE || p.bsize.count_ones() != 1 {
        return Err(anyhow!("tamaño de bloque inválido: {}", p.bsize));
    }
    if p.fsize <= 0 || p.fsize.count_ones() != 1 || p.fsize > p.bsize || p.bsize / p.fsize > MAXFRAG {
        return Err(anyhow!("tamaño de fragmento inválido: {}", p.fsize));
    }
    if p.fsize < DIRBLKSIZ as i32 {
        return Err(anyhow!("el fragmento debe alojar al menos un trozo de directorio"));
    }
    let frag = p.bsize / p.fsize;
    if p.ncg < 1 || p.fpg <= 0 || p.fpg % frag != 0 {
        return Err(anyhow!("grupos inválidos: ncg={}, fpg={}", p.ncg, p.fpg));
    }
    if p.version == UfsVersion::Ufs2 && p.cg_format == CgFormat::Static {
        return Err(anyhow!("UFS2 sólo admite grupos dinámicos"));
    }

    let isize = match p.version {
        UfsVersion::Ufs1 => crate::inode::UFS1_DINODE_SIZE,
        UfsVersion::Ufs2 => crate::inode::UFS2_DINODE_SIZE,
    } as i64;
    let inopb = i64::from(p.bsize) / isize;
    if p.ipg <= 0 || i64::from(p.ipg) % inopb != 0 {
        return Err(anyhow!("ipg ({}) debe ser múltiplo de {}", p.ipg, inopb));
    }

    let fsize = i64::from(p.fsize);
    let frag = i64::from(frag);
    let sblockloc = match p.version {
        UfsVersion::Ufs1 => SBLOCK_UFS1,
        UfsVersion::Ufs2 => SBLOCK_UFS2,
    };
    let sblkno = roundup(howmany(sblockloc as i64 + SBLOCKSIZE as i64, fsize), frag);
    let cblkno = sblkno + roundup(howmany(SBLOCKSIZE as i64, fsize), frag);
    let iblkno = cblkno + frag;
    let dblkno = iblkno + roundup(howmany(i64::from(p.ipg) * isize, fsize), frag);
    if dblkno >= i64::from(p.fpg) {
        return Err(anyhow!("el grupo ({} fragmentos) no aloja sus metadatos", p.fpg));
    }

    let cpg = match p.version {
        UfsVersion::Ufs1 => {
            let spc_frags = i64::from(NSECT * NTRAK) / (fsize / DEV_BSIZE);
            if i64::from(p.fpg) % spc_frags != 0 {
                return Err(anyhow!("fpg debe ser múltiplo de {} (un cilindro)", spc_frags));
            }
            (i64::from(p.fpg) / spc_frags) as i32
        }
        UfsVersion::Ufs2 => 1,
    };
    if p.cg_format == CgFormat::Static && (cpg > MAXCPG_STATIC || p.ipg > 2048) {
        return Err(anyhow!("geometría demasiado grande para grupos estáticos"));
    }

    Ok(FsLayout {
        sblockloc,
        sblkno: sblkno as i32,
        cblkno: cblkno as i32,
        iblkno: iblkno as i32,
        dblkno: dblkno as i32,
        cpg,
    })
}

fn init_superblock(p: &MkfsParams, l: &FsLayout) -> Result<Superblock> {
    let mut sb = Superblock::blank(p.version, SBLOCKSIZE);
    let ufs1 = p.version == UfsVersion::Ufs1;
    let frag = p.bsize / p.fsize;
    let ptr = match p.version {
        UfsVersion::Ufs1 => 4,
        UfsVersion::Ufs2 => 8,
    };

    sb.sblockloc = l.sblockloc as i64;
    sb.sblkno = l.sblkno;
    sb.cblkno = l.cblkno;
    sb.iblkno = l.iblkno;
    sb.dblkno = l.dblkno;
    sb.cgoffset = 0;
    sb.cgmask = -1;
    sb.time = p.time;
    sb.ncg = p.ncg;
    sb.size = i64::from(p.ncg) * i64::from(p.fpg);
    sb.bsize = p.bsize;
    sb.fsize = p.fsize;
    sb.frag = frag;
    sb.minfree = 8;
    sb.bmask = !(p.bsize - 1);
    sb.fmask = !(p.fsize - 1);
    sb.bshift = log2(p.bsize);
    sb.fshift = log2(p.fsize);
    sb.maxcontig = 1;
    sb.maxbpg = p.bsize / ptr;
    sb.fragshift = log2(frag);
    sb.fsbtodb = log2(p.fsize / DEV_BSIZE as i32);
    sb.sbsize = SBLOCKSIZE as i32;
    sb.nindir = p.bsize / ptr;
    sb.inopb = p.bsize / sb.inode_size() as i32;
    sb.nspf = p.fsize / DEV_BSIZE as i32;
    sb.cssize = sb.fragroundup(i64::from(p.ncg) * CSUM_SIZE as i64) as i32;
    sb.ipg = p.ipg;
    sb.fpg = p.fpg;
    sb.contigsumsize = if p.cg_format == CgFormat::Dynamic { p.contigsumsize } else { 0 };
    sb.maxbsize = p.bsize;
    sb.qbmask = i64::from(p.bsize - 1);
    sb.qfmask = i64::from(p.fsize - 1);
    sb.clean = FS_ISCLEAN;
    sb.maxfilesize = max_file_size(sb.bsize, sb.nindir);
    if ufs1 {
        sb.nsect = NSECT;
        sb.ntrak = NTRAK;
        sb.spc = NSECT * NTRAK;
        sb.cpg = l.cpg;
        sb.ncyl = l.cpg * p.ncg;
        sb.nrpos = NRPOS;
    }
    match p.cg_format {
        CgFormat::Static => {
            sb.postblformat = FS_42POSTBLFMT;
            sb.inodefmt = FS_42INODEFMT;
            sb.maxsymlinklen = 0;
        }
        CgFormat::Dynamic => {
            sb.postblformat = FS_DYNAMICPOSTBLFMT;
            sb.inodefmt = FS_44INODEFMT;
            sb.maxsymlinklen = ((NDADDR + NIADDR) * ptr as usize) as i32;
            if ufs1 {
                sb.flags |= FS_FLAGS_UPDATED;
            }
        }
    }
    let hdr = cg_header_size(&sb, p.cg_format) as i64;
    sb.cgsize = sb.fragroundup(hdr) as i32;
    if sb.cgsize > sb.bsize {
        return Err(anyhow!("el grupo de cilindros ({} bytes) no cabe en un bloque", hdr));
    }
    sb.csaddr = sb.cgdmin(0);
    sb.dsize = sb.size - sb.cgdmin(0) - sb.cs_frags();
    Ok(sb)
}

/// Inodo de directorio con un único fragmento de datos.
fn dir_inode(sb: &Superblock, blk: Daddr, size: u64, nlink: i16, time: i64) -> Dinode {
    let mut dp = Dinode {
        mode: IFDIR | 0o755,
        nlink,
        size,
        blocks: sb.btodb(i64::from(sb.fsize)),
        atime: time,
        mtime: time,
        ctime: time,
        ..Dinode::default()
    };
    dp.db[0] = blk;
    dp
}

/// Escribe un inodo en su lugar dentro de la tabla del grupo.
pub fn put_inode(img: &mut [u8], sb: &Superblock, ino: Ino, dp: &Dinode) {
    let isize = sb.inode_size();
    let at = sb.byte_offset(sb.ino_to_fsba(ino)) as usize + sb.ino_to_fsbo(ino) * isize;
    dp.encode(sb.version, &mut img[at..at + isize]);
}

/// Formatea una imagen completa.
pub fn build_image(p: &MkfsParams) -> Result<Vec<u8>> {
    let layout = build_layout(p)?;
    let mut sb = init_superblock(p, &layout)?;
    let fsize = sb.fsize as usize;
    let total = sb.size as usize * fsize;
    let mut img = Vec::new();
    img.try_reserve_exact(total)
        .map_err(|_| anyhow!("sin memoria para una imagen de {} bytes", total))?;
    img.resize(total, 0);

    let fmt = DirFormat::for_fs(&sb, None);
    let rootblk = sb.cgdmin(0) + sb.cs_frags();
    let lfblk = rootblk + 1;
    let time = p.time;

    // Raíz: ".", ".." y "lost+found" en un trozo.
    let root_at = sb.byte_offset(rootblk) as usize;
    {
        let chunk = &mut img[root_at..root_at + DIRBLKSIZ];
        let dot = dirsiz(1);
        let dotdot = dirsiz(2);
        fmt.write_entry(chunk, 0, ROOTINO, dot, DT_DIR, b".");
        fmt.write_entry(chunk, dot, ROOTINO, dotdot, DT_DIR, b"..");
        fmt.write_entry(chunk, dot + dotdot, LOSTFOUNDINO, DIRBLKSIZ - dot - dotdot, DT_DIR, b"lost+found");
    }
    let lf_at = sb.byte_offset(lfblk) as usize;
    crate::dir::dir_template(&mut img[lf_at..lf_at + fsize], fmt, LOSTFOUNDINO, ROOTINO);

    put_inode(&mut img, &sb, ROOTINO, &dir_inode(&sb, rootblk, DIRBLKSIZ as u64, 3, time));
    put_inode(&mut img, &sb, LOSTFOUNDINO, &dir_inode(&sb, lfblk, fsize as u64, 2, time));

    // Grupos de cilindros.
    let mut csums = Vec::with_capacity(p.ncg as usize);
    let mut total_cs = CsumTotal::default();
    for c in 0..i64::from(sb.ncg) {
        let cg = build_cg(&sb, p, c, lfblk);
        let at = sb.byte_offset(sb.cgtod(c)) as usize;
        cg.encode(&mut img[at..at + sb.bsize as usize], sb.is_ufs2(), p.cg_format);
        total_cs.add(&cg.cs);
        csums.push(cg.cs);
    }
    sb.cstotal = total_cs;

    let cs_at = sb.byte_offset(sb.csaddr) as usize;
    for (i, cs) in csums.iter().enumerate() {
        cs.encode(&mut img[cs_at + i * CSUM_SIZE..cs_at + (i + 1) * CSUM_SIZE]);
    }

    let raw = sb.encode();
    let primary = layout.sblockloc as usize;
    img[primary..primary + raw.len()].copy_from_slice(&raw);
    for c in 0..i64::from(sb.ncg) {
        let at = sb.byte_offset(sb.cgsblock(c)) as usize;
        img[at..at + raw.len()].copy_from_slice(&raw);
    }
    Ok(img)
}

fn build_cg(sb: &Superblock, p: &MkfsParams, c: i64, lfblk: Daddr) -> CylinderGroup {
    let mut cg = CylinderGroup::blank(sb, p.cg_format);
    cg.time = p.time;
    cg.cgx = c as i32;
    cg.ndblk = sb.fpg;
    if sb.is_ufs2() {
        cg.ffs2_niblk = sb.ipg;
        cg.initediblk = sb.ipg.min(2 * sb.inopb);
    } else {
        cg.ncyl = sb.cpg as i16;
        cg.niblk = sb.ipg as i16;
    }
    if sb.contigsumsize > 0 {
        cg.nclusterblks = cg.ndblk / sb.frag;
    }

    cg.cs.nifree = sb.ipg;
    if c == 0 {
        for ino in 0..=LOSTFOUNDINO {
            setbit(&mut cg.inosused, ino as usize);
            cg.cs.nifree -= 1;
        }
        cg.cs.ndir = 2;
    }

    let dbase = sb.cgbase(c);
    let (start, end) = if c == 0 {
        (dbase, lfblk + 1)
    } else {
        (sb.cgsblock(c), sb.cgdmin(c))
    };
    cg.account_blocks(sb, dbase, dbase + i64::from(sb.fpg), |d| d >= start && d < end);
    cg
}
