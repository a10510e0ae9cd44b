// src/cg.rs
//
// Grupos de cilindros en disco. Hay dos codificaciones históricas:
//  - estática (4.2BSD, `ocg`): tablas rotacionales de tamaño fijo y el magic
//    al final de la cabecera;
//  - dinámica: la cabecera describe los offsets de cada tabla.
// Ambas se decodifican a `CylinderGroup` y se codifican de vuelta en el mismo
// buffer, sin tocar los bytes que no se conocen.

use crate::fs::{get_i16, get_i32, get_i64, howmany, put_i16, put_i32, put_i64, Csum, Daddr, Superblock, MAXFRAG};

pub const CG_MAGIC: i32 = 0x0009_0255;

// Cabecera dinámica.
const CG_MAGIC_OFF: usize = 4;
const CG_TIME: usize = 8;
const CG_CGX: usize = 12;
const CG_NCYL: usize = 16;
const CG_NIBLK: usize = 18;
const CG_NDBLK: usize = 20;
const CG_CS: usize = 24;
const CG_ROTOR: usize = 40;
const CG_FROTOR: usize = 44;
const CG_IROTOR: usize = 48;
const CG_FRSUM: usize = 52;
const CG_BTOTOFF: usize = 84;
const CG_BOFF: usize = 88;
const CG_IUSEDOFF: usize = 92;
const CG_FREEOFF: usize = 96;
const CG_NEXTFREEOFF: usize = 100;
const CG_CLUSTERSUMOFF: usize = 104;
const CG_CLUSTEROFF: usize = 108;
const CG_NCLUSTERBLKS: usize = 112;
const CG_FFS2_NIBLK: usize = 116;
const CG_INITEDIBLK: usize = 120;
const CG_FFS2_TIME: usize = 136;
/// Primer byte libre tras la cabecera dinámica (`cg_space`).
pub const CG_SPACE: usize = 168;

// Formato estático: offsets fijos.
const OCG_BTOT: usize = 84;
const OCG_B: usize = 212;
const OCG_IUSED: usize = 724;
const OCG_MAGIC: usize = 980;
const OCG_FREE: usize = 984;
const OCG_MAXCPG: usize = 32;
const OCG_NRPOS: usize = 8;
const OCG_IUSED_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgFormat {
    Static,
    Dynamic,
}

/// Offsets de las tablas dentro del bloque del grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CgLayout {
    pub btotoff: i32,
    pub boff: i32,
    pub iusedoff: i32,
    pub freeoff: i32,
    pub nextfreeoff: i32,
    pub clustersumoff: i32,
    pub clusteroff: i32,
}

/// Longitudes de cada tabla, derivadas del superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgSizes {
    pub btot: usize,
    pub b: usize,
    pub inosused: usize,
    pub blksfree: usize,
    pub clustersum: usize,
    pub clustersfree: usize,
}

impl CgSizes {
    pub fn of(sb: &Superblock, format: CgFormat) -> Self {
        let ipg_bytes = howmany(i64::from(sb.ipg), 8) as usize;
        let fpg_bytes = howmany(i64::from(sb.fpg), 8) as usize;
        let (btot, b, inosused) = match format {
            CgFormat::Static => (OCG_MAXCPG, OCG_MAXCPG * OCG_NRPOS, OCG_IUSED_LEN),
            CgFormat::Dynamic if sb.is_ufs2() => (0, 0, ipg_bytes),
            CgFormat::Dynamic => (
                sb.cpg.max(0) as usize,
                sb.cpg.max(0) as usize * sb.nrpos.max(0) as usize,
                ipg_bytes,
            ),
        };
        let (clustersum, clustersfree) = if format == CgFormat::Dynamic && sb.contigsumsize > 0 {
            (
                sb.contigsumsize as usize + 1,
                howmany(sb.fragstoblks(i64::from(sb.fpg)), 8) as usize,
            )
        } else {
            (0, 0)
        };
        Self {
            btot,
            b,
            inosused,
            blksfree: fpg_bytes,
            clustersum,
            clustersfree,
        }
    }
}

impl CgLayout {
    /// Offsets que corresponden al superblock. Para el formato estático son
    /// los de `struct ocg`.
    pub fn for_fs(sb: &Superblock, format: CgFormat) -> Self {
        let sizes = CgSizes::of(sb, format);
        match format {
            CgFormat::Static => {
                let freeoff = OCG_FREE as i32;
                Self {
                    btotoff: OCG_BTOT as i32,
                    boff: OCG_B as i32,
                    iusedoff: OCG_IUSED as i32,
                    freeoff,
                    nextfreeoff: freeoff + sizes.blksfree as i32,
                    clustersumoff: 0,
                    clusteroff: 0,
                }
            }
            CgFormat::Dynamic => {
                let btotoff = CG_SPACE as i32;
                let boff = btotoff + 4 * sizes.btot as i32;
                let iusedoff = boff + 2 * sizes.b as i32;
                let freeoff = iusedoff + sizes.inosused as i32;
                let mut nextfreeoff = freeoff + sizes.blksfree as i32;
                let mut clustersumoff = 0;
                let mut clusteroff = 0;
                if sizes.clustersum > 0 {
                    clustersumoff = ((nextfreeoff - 4) + 3) & !3;
                    clusteroff = clustersumoff + 4 * sizes.clustersum as i32;
                    nextfreeoff = clusteroff + sizes.clustersfree as i32;
                }
                Self {
                    btotoff,
                    boff,
                    iusedoff,
                    freeoff,
                    nextfreeoff,
                    clustersumoff,
                    clusteroff,
                }
            }
        }
    }
}

/// Bytes que ocupa un grupo con este superblock y formato.
pub fn cg_header_size(sb: &Superblock, format: CgFormat) -> usize {
    CgLayout::for_fs(sb, format).nextfreeoff.max(0) as usize
}

/// Vista canónica de un grupo de cilindros.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CylinderGroup {
    pub magic: i32,
    pub time: i64,
    pub cgx: i32,
    pub ncyl: i16,
    pub niblk: i16,
    pub ndblk: i32,
    pub cs: Csum,
    pub rotor: i32,
    pub frotor: i32,
    pub irotor: i32,
    pub frsum: [i32; MAXFRAG as usize],
    pub layout: CgLayout,
    pub nclusterblks: i32,
    pub ffs2_niblk: i32,
    pub initediblk: i32,
    pub btot: Vec<i32>,
    pub b: Vec<i16>,
    pub inosused: Vec<u8>,
    pub blksfree: Vec<u8>,
    pub clustersum: Vec<i32>,
    pub clustersfree: Vec<u8>,
}

fn region(buf: &[u8], off: i32, len: usize) -> Option<&[u8]> {
    let off = usize::try_from(off).ok()?;
    buf.get(off..off.checked_add(len)?)
}

fn read_i32s(buf: &[u8], off: i32, n: usize) -> Vec<i32> {
    match region(buf, off, 4 * n) {
        Some(r) => (0..n).map(|i| get_i32(r, 4 * i)).collect(),
        None => Vec::new(),
    }
}

fn read_i16s(buf: &[u8], off: i32, n: usize) -> Vec<i16> {
    match region(buf, off, 2 * n) {
        Some(r) => (0..n).map(|i| get_i16(r, 2 * i)).collect(),
        None => Vec::new(),
    }
}

/// `clustersum` sin su primera entrada, que nunca se guarda.
fn read_clustersum(buf: &[u8], off: i32, n: usize) -> Vec<i32> {
    if n == 0 {
        return Vec::new();
    }
    let rest = read_i32s(buf, off.saturating_add(4), n - 1);
    if rest.len() != n - 1 {
        return Vec::new();
    }
    std::iter::once(0).chain(rest).collect()
}

fn read_bytes(buf: &[u8], off: i32, n: usize) -> Vec<u8> {
    region(buf, off, n).map(<[u8]>::to_vec).unwrap_or_default()
}

/// ¿Tiene el bloque el magic de grupo en alguno de los dos formatos?
pub fn cg_chkmagic(buf: &[u8]) -> bool {
    (buf.len() >= 8 && get_i32(buf, CG_MAGIC_OFF) == CG_MAGIC)
        || (buf.len() >= OCG_MAGIC + 4 && get_i32(buf, OCG_MAGIC) == CG_MAGIC)
}

impl CylinderGroup {
    /// Decodifica el bloque de un grupo. En formato dinámico los offsets se
    /// toman de la propia cabecera; una tabla fuera del bloque se decodifica
    /// vacía (y por tanto nunca coincide con la reconstruida).
    pub fn decode(buf: &[u8], sb: &Superblock, format: CgFormat) -> Self {
        let sizes = CgSizes::of(sb, format);
        let mut frsum = [0i32; MAXFRAG as usize];
        for (i, f) in frsum.iter_mut().enumerate() {
            *f = get_i32(buf, CG_FRSUM + 4 * i);
        }
        let cs = Csum::decode(&buf[CG_CS..CG_CS + 16]);
        match format {
            CgFormat::Static => {
                let layout = CgLayout::for_fs(sb, format);
                Self {
                    magic: if buf.len() >= OCG_MAGIC + 4 { get_i32(buf, OCG_MAGIC) } else { 0 },
                    time: i64::from(get_i32(buf, CG_TIME)),
                    cgx: get_i32(buf, CG_CGX),
                    ncyl: get_i16(buf, CG_NCYL),
                    niblk: get_i16(buf, CG_NIBLK),
                    ndblk: get_i32(buf, CG_NDBLK),
                    cs,
                    rotor: get_i32(buf, CG_ROTOR),
                    frotor: get_i32(buf, CG_FROTOR),
                    irotor: get_i32(buf, CG_IROTOR),
                    frsum,
                    layout,
                    nclusterblks: 0,
                    ffs2_niblk: 0,
                    initediblk: 0,
                    btot: read_i32s(buf, layout.btotoff, sizes.btot),
                    b: read_i16s(buf, layout.boff, sizes.b),
                    inosused: read_bytes(buf, layout.iusedoff, sizes.inosused),
                    blksfree: read_bytes(buf, layout.freeoff, sizes.blksfree),
                    clustersum: Vec::new(),
                    clustersfree: Vec::new(),
                }
            }
            CgFormat::Dynamic => {
                let layout = CgLayout {
                    btotoff: get_i32(buf, CG_BTOTOFF),
                    boff: get_i32(buf, CG_BOFF),
                    iusedoff: get_i32(buf, CG_IUSEDOFF),
                    freeoff: get_i32(buf, CG_FREEOFF),
                    nextfreeoff: get_i32(buf, CG_NEXTFREEOFF),
                    clustersumoff: get_i32(buf, CG_CLUSTERSUMOFF),
                    clusteroff: get_i32(buf, CG_CLUSTEROFF),
                };
                let ufs2 = sb.is_ufs2();
                Self {
                    magic: get_i32(buf, CG_MAGIC_OFF),
                    time: if ufs2 {
                        get_i64(buf, CG_FFS2_TIME)
                    } else {
                        i64::from(get_i32(buf, CG_TIME))
                    },
                    cgx: get_i32(buf, CG_CGX),
                    ncyl: get_i16(buf, CG_NCYL),
                    niblk: get_i16(buf, CG_NIBLK),
                    ndblk: get_i32(buf, CG_NDBLK),
                    cs,
                    rotor: get_i32(buf, CG_ROTOR),
                    frotor: get_i32(buf, CG_FROTOR),
                    irotor: get_i32(buf, CG_IROTOR),
                    frsum,
                    layout,
                    nclusterblks: get_i32(buf, CG_NCLUSTERBLKS),
                    ffs2_niblk: get_i32(buf, CG_FFS2_NIBLK),
                    initediblk: get_i32(buf, CG_INITEDIBLK),
                    btot: read_i32s(buf, layout.btotoff, sizes.btot),
                    b: read_i16s(buf, layout.boff, sizes.b),
                    inosused: read_bytes(buf, layout.iusedoff, sizes.inosused),
                    blksfree: read_bytes(buf, layout.freeoff, sizes.blksfree),
                    clustersum: read_clustersum(buf, layout.clustersumoff, sizes.clustersum),
                    clustersfree: read_bytes(buf, layout.clusteroff, sizes.clustersfree),
                }
            }
        }
    }

    /// Grupo vacío con las tablas dimensionadas para `sb`.
    pub fn blank(sb: &Superblock, format: CgFormat) -> Self {
        let sizes = CgSizes::of(sb, format);
        Self {
            magic: CG_MAGIC,
            layout: CgLayout::for_fs(sb, format),
            btot: vec![0; sizes.btot],
            b: vec![0; sizes.b],
            inosused: vec![0; sizes.inosused],
            blksfree: vec![0; sizes.blksfree],
            clustersum: vec![0; sizes.clustersum],
            clustersfree: vec![0; sizes.clustersfree],
            ..Self::default()
        }
    }

    /// Escribe la cabecera y todas las tablas sobre `buf`.
    pub fn encode(&self, buf: &mut [u8], ufs2: bool, format: CgFormat) {
        self.encode_header(buf, ufs2, format);
        self.encode_sums(buf);
        self.encode_maps(buf);
    }

    pub fn encode_header(&self, buf: &mut [u8], ufs2: bool, format: CgFormat) {
        put_i32(buf, CG_CGX, self.cgx);
        put_i16(buf, CG_NCYL, self.ncyl);
        put_i16(buf, CG_NIBLK, self.niblk);
        put_i32(buf, CG_NDBLK, self.ndblk);
        self.cs.encode(&mut buf[CG_CS..CG_CS + 16]);
        put_i32(buf, CG_ROTOR, self.rotor);
        put_i32(buf, CG_FROTOR, self.frotor);
        put_i32(buf, CG_IROTOR, self.irotor);
        for (i, f) in self.frsum.iter().enumerate() {
            put_i32(buf, CG_FRSUM + 4 * i, *f);
        }
        match format {
            CgFormat::Static => {
                put_i32(buf, CG_TIME, self.time as i32);
                if buf.len() >= OCG_MAGIC + 4 {
                    put_i32(buf, OCG_MAGIC, self.magic);
                }
            }
            CgFormat::Dynamic => {
                put_i32(buf, CG_MAGIC_OFF, self.magic);
                if ufs2 {
                    put_i64(buf, CG_FFS2_TIME, self.time);
                } else {
                    put_i32(buf, CG_TIME, self.time as i32);
                }
                put_i32(buf, CG_BTOTOFF, self.layout.btotoff);
                put_i32(buf, CG_BOFF, self.layout.boff);
                put_i32(buf, CG_IUSEDOFF, self.layout.iusedoff);
                put_i32(buf, CG_FREEOFF, self.layout.freeoff);
                put_i32(buf, CG_NEXTFREEOFF, self.layout.nextfreeoff);
                put_i32(buf, CG_CLUSTERSUMOFF, self.layout.clustersumoff);
                put_i32(buf, CG_CLUSTEROFF, self.layout.clusteroff);
                put_i32(buf, CG_NCLUSTERBLKS, self.nclusterblks);
                put_i32(buf, CG_FFS2_NIBLK, self.ffs2_niblk);
                put_i32(buf, CG_INITEDIBLK, self.initediblk);
            }
        }
    }

    pub fn encode_sums(&self, buf: &mut [u8]) {
        write_i32s(buf, self.layout.btotoff, &self.btot);
        write_i16s(buf, self.layout.boff, &self.b);
    }

    pub fn encode_maps(&self, buf: &mut [u8]) {
        write_bytes(buf, self.layout.iusedoff, &self.inosused);
        write_bytes(buf, self.layout.freeoff, &self.blksfree);
        // clustersum[0] no existe en disco: se solapa con el final de blksfree.
        if let Some(sums) = self.clustersum.get(1..) {
            write_i32s(buf, self.layout.clustersumoff.saturating_add(4), sums);
        }
        write_bytes(buf, self.layout.clusteroff, &self.clustersfree);
    }

    /// Cabecera (incluido el resumen) igual a la de `other`.
    pub fn header_eq(&self, other: &Self) -> bool {
        self.magic == other.magic
            && self.time == other.time
            && self.cgx == other.cgx
            && self.ncyl == other.ncyl
            && self.niblk == other.niblk
            && self.ndblk == other.ndblk
            && self.cs == other.cs
            && self.rotor == other.rotor
            && self.frotor == other.frotor
            && self.irotor == other.irotor
            && self.frsum == other.frsum
            && self.layout == other.layout
            && self.nclusterblks == other.nclusterblks
            && self.ffs2_niblk == other.ffs2_niblk
            && self.initediblk == other.initediblk
    }

    /// Tablas rotacionales iguales.
    pub fn sums_eq(&self, other: &Self) -> bool {
        self.btot == other.btot && self.b == other.b
    }

    /// Mapas de inodos, fragmentos y clusters iguales.
    pub fn maps_eq(&self, other: &Self) -> bool {
        self.inosused == other.inosused
            && self.blksfree == other.blksfree
            && self.clustersum == other.clustersum
            && self.clustersfree == other.clustersfree
    }
}

impl CylinderGroup {
    /// Recalcula el mapa de fragmentos libres, los contadores de bloques y
    /// fragmentos, el histograma `frsum`, las tablas rotacionales (UFS1) y
    /// los clusters del grupo que cubre `[dbase, dmax)`. `used` dice si un
    /// fragmento absoluto está ocupado.
    pub fn account_blocks<F>(&mut self, sb: &Superblock, dbase: Daddr, dmax: Daddr, used: F)
    where
        F: Fn(Daddr) -> bool,
    {
        let frag = sb.frag.max(1) as usize;
        let stride = if self.btot.is_empty() { 0 } else { self.b.len() / self.btot.len() };
        let mut i = 0usize;
        let mut d = dbase;
        while d < dmax {
            let mut frags = 0;
            for j in 0..frag {
                if used(d + j as Daddr) {
                    continue;
                }
                setbit(&mut self.blksfree, i + j);
                frags += 1;
            }
            if frags == frag {
                self.cs.nbfree += 1;
                if stride > 0 {
                    let cyl = sb.cbtocylno(i as i64);
                    if let Some(t) = self.btot.get_mut(cyl) {
                        *t += 1;
                    }
                    if let Some(p) = self.b.get_mut(cyl * stride + sb.cbtorpos(i as i64)) {
                        *p += 1;
                    }
                }
                if !self.clustersfree.is_empty() {
                    setbit(&mut self.clustersfree, i / frag);
                }
            } else if frags > 0 {
                self.cs.nffree += frags as i32;
                let map = blkmap(&self.blksfree, i, frag);
                fragacct(map, frag, &mut self.frsum, 1);
            }
            i += frag;
            d += frag as Daddr;
        }
        if !self.clustersum.is_empty() {
            let contig = self.clustersum.len() - 1;
            cluster_histogram(
                &self.clustersfree,
                self.nclusterblks.max(0) as usize,
                contig,
                &mut self.clustersum,
            );
        }
    }
}

fn write_i32s(buf: &mut [u8], off: i32, vals: &[i32]) {
    let Ok(off) = usize::try_from(off) else { return };
    if vals.is_empty() || off + 4 * vals.len() > buf.len() {
        return;
    }
    for (i, v) in vals.iter().enumerate() {
        put_i32(buf, off + 4 * i, *v);
    }
}

fn write_i16s(buf: &mut [u8], off: i32, vals: &[i16]) {
    let Ok(off) = usize::try_from(off) else { return };
    if vals.is_empty() || off + 2 * vals.len() > buf.len() {
        return;
    }
    for (i, v) in vals.iter().enumerate() {
        put_i16(buf, off + 2 * i, *v);
    }
}

fn write_bytes(buf: &mut [u8], off: i32, vals: &[u8]) {
    let Ok(off) = usize::try_from(off) else { return };
    if vals.is_empty() || off + vals.len() > buf.len() {
        return;
    }
    buf[off..off + vals.len()].copy_from_slice(vals);
}

// -----------------------------------------------------------------------------
// Bits e histogramas
// -----------------------------------------------------------------------------

pub fn isset(map: &[u8], i: usize) -> bool {
    map.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0)
}

pub fn setbit(map: &mut [u8], i: usize) {
    if let Some(b) = map.get_mut(i / 8) {
        *b |= 1 << (i % 8);
    }
}

pub fn clrbit(map: &mut [u8], i: usize) {
    if let Some(b) = map.get_mut(i / 8) {
        *b &= !(1 << (i % 8));
    }
}

/// Bits libres del bloque que empieza en el fragmento relativo `i`.
pub fn blkmap(map: &[u8], i: usize, frag: usize) -> u32 {
    (0..frag).fold(0u32, |acc, j| if isset(map, i + j) { acc | (1 << j) } else { acc })
}

/// Suma `cnt` al histograma de fragmentos libres por cada tramo maximal de
/// fragmentos libres dentro de un bloque parcialmente libre.
pub fn fragacct(fragmap: u32, frag: usize, frsum: &mut [i32], cnt: i32) {
    let mut run = 0usize;
    for j in 0..=frag {
        if j < frag && fragmap & (1 << j) != 0 {
            run += 1;
        } else {
            if run > 0 && run < frag {
                if let Some(slot) = frsum.get_mut(run) {
                    *slot += cnt;
                }
            }
            run = 0;
        }
    }
}

/// Histograma de tramos de bloques libres contiguos (clusters), saturado en
/// `contigsumsize`.
pub fn cluster_histogram(clustersfree: &[u8], nclusterblks: usize, contigsumsize: usize, sump: &mut [i32]) {
    let mut run = 0usize;
    let mut bump = |run: usize, sump: &mut [i32]| {
        let r = run.min(contigsumsize);
        if let Some(slot) = sump.get_mut(r) {
            *slot += 1;
        }
    };
    for i in 0..nclusterblks {
        if isset(clustersfree, i) {
            run += 1;
        } else if run != 0 {
            bump(run, sump);
            run = 0;
        }
    }
    if run != 0 {
        bump(run, sump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::UfsVersion;

    fn sb(version: UfsVersion, contig: i32) -> Superblock {
        let mut sb = Superblock::blank(version, 8192);
        sb.bsize = 8192;
        sb.fsize = 1024;
        sb.frag = 8;
        sb.fragshift = 3;
        sb.cpg = 16;
        sb.nrpos = 8;
        sb.ipg = 1024;
        sb.fpg = 8192;
        sb.contigsumsize = contig;
        sb
    }

    #[test]
    fn fragacct_counts_maximal_runs() {
        let mut frsum = [0i32; 8];
        // Libres: 0,1 y 4,5,6 -> un tramo de 2 y uno de 3.
        fragacct(0b0111_0011, 8, &mut frsum, 1);
        assert_eq!(frsum, [0, 0, 1, 1, 0, 0, 0, 0]);
        // Bloque entero libre: no cuenta como fragmentos.
        let mut frsum = [0i32; 8];
        fragacct(0xff, 8, &mut frsum, 1);
        assert_eq!(frsum, [0; 8]);
    }

    #[test]
    fn cluster_histogram_saturates() {
        let mut map = vec![0u8; 2];
        for i in [0, 1, 2, 5, 8, 9, 10, 11, 12, 13] {
            setbit(&mut map, i);
        }
        let mut sump = vec![0i32; 4];
        cluster_histogram(&map, 16, 3, &mut sump);
        // Tramos: 3, 1, 6 (saturado a 3).
        assert_eq!(sump, vec![0, 1, 0, 2]);
    }

    #[test]
    fn dynamic_layout_is_self_describing() {
        let sb = sb(UfsVersion::Ufs1, 0);
        let mut cg = CylinderGroup::blank(&sb, CgFormat::Dynamic);
        cg.cgx = 3;
        cg.cs.nbfree = 12;
        setbit(&mut cg.blksfree, 17);
        let mut buf = vec![0u8; 8192];
        cg.encode(&mut buf, false, CgFormat::Dynamic);
        assert!(cg_chkmagic(&buf));
        let again = CylinderGroup::decode(&buf, &sb, CgFormat::Dynamic);
        assert_eq!(again, cg);
    }

    #[test]
    fn static_layout_keeps_magic_at_the_end() {
        let sb = sb(UfsVersion::Ufs1, 0);
        let cg = CylinderGroup::blank(&sb, CgFormat::Static);
        let mut buf = vec![0u8; 8192];
        cg.encode(&mut buf, false, CgFormat::Static);
        assert_eq!(get_i32(&buf, OCG_MAGIC), CG_MAGIC);
        assert_eq!(get_i32(&buf, CG_MAGIC_OFF), 0);
        assert!(cg_chkmagic(&buf));
        assert_eq!(CylinderGroup::decode(&buf, &sb, CgFormat::Static), cg);
    }

    #[test]
    fn all_free_group_counts_whole_blocks() {
        let mut sb = sb(UfsVersion::Ufs2, 4);
        sb.fpg = 256;
        let mut cg = CylinderGroup::blank(&sb, CgFormat::Dynamic);
        cg.nclusterblks = 32;
        cg.account_blocks(&sb, 0, 256, |_| false);
        assert_eq!(cg.cs.nbfree, 32);
        assert_eq!(cg.cs.nffree, 0);
        assert_eq!(cg.frsum, [0; 8]);
        // Un único tramo de 32 bloques, saturado en 4.
        assert_eq!(cg.clustersum, vec![0, 0, 0, 0, 1]);
    }

    #[test]
    fn partial_blocks_feed_frsum() {
        let mut sb = sb(UfsVersion::Ufs1, 0);
        sb.fpg = 16;
        sb.spc = 64;
        sb.nsect = 32;
        sb.fsbtodb = 1;
        let mut cg = CylinderGroup::blank(&sb, CgFormat::Dynamic);
        // Primer bloque: fragmentos 0..3 ocupados; segundo bloque libre.
        cg.account_blocks(&sb, 0, 16, |d| d < 3);
        assert_eq!(cg.cs.nbfree, 1);
        assert_eq!(cg.cs.nffree, 5);
        assert_eq!(cg.frsum[5], 1);
        assert_eq!(cg.btot.iter().sum::<i32>(), 1);
        assert_eq!(cg.b.iter().map(|&v| i32::from(v)).sum::<i32>(), 1);
    }

    #[test]
    fn all_free_map_survives_the_cluster_tables() {
        let mut sb = sb(UfsVersion::Ufs2, 4);
        sb.fpg = 2048;
        let mut cg = CylinderGroup::blank(&sb, CgFormat::Dynamic);
        cg.nclusterblks = 256;
        cg.account_blocks(&sb, 0, 2048, |_| false);
        let mut buf = vec![0u8; 8192];
        cg.encode(&mut buf, true, CgFormat::Dynamic);

        let again = CylinderGroup::decode(&buf, &sb, CgFormat::Dynamic);
        let busy: Vec<usize> = (0..again.blksfree.len()).filter(|&i| again.blksfree[i] != 0xff).collect();
        assert!(busy.is_empty(), "{busy:?}");
        assert_eq!(again.clustersum, vec![0, 0, 0, 0, 1]);
        assert!(again.maps_eq(&cg));
        assert_eq!(again, cg);
    }

    #[test]
    fn cluster_tables_follow_the_free_map() {
        let sb = sb(UfsVersion::Ufs2, 4);
        let l = CgLayout::for_fs(&sb, CgFormat::Dynamic);
        assert_eq!(l.iusedoff, CG_SPACE as i32);
        assert_eq!(l.freeoff, l.iusedoff + 128);
        assert!(l.clustersumoff >= l.freeoff + 1024 - 4);
        assert_eq!(l.clusteroff, l.clustersumoff + 20);
        assert_eq!(l.nextfreeoff, l.clusteroff + 128);
    }
}
