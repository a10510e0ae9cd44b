// src/fs.rs
use thiserror::Error;

// -----------------------------------------------------------------------------
// Constantes del formato FFS/UFS
// -----------------------------------------------------------------------------

/// Número de fragmento (dirección de disco en unidades de `fs_fsize`).
pub type Daddr = i64;
/// Número de inodo.
pub type Ino = u32;

pub const FS_UFS1_MAGIC: i32 = 0x0001_1954;
pub const FS_UFS2_MAGIC: i32 = 0x1954_0119;

pub const SBLOCK_FLOPPY: u64 = 0;
pub const SBLOCK_UFS1: u64 = 8192;
pub const SBLOCK_UFS2: u64 = 65536;
pub const SBLOCK_PIGGY: u64 = 262_144;
/// Orden en que se buscan las copias primarias del superblock.
pub const SBLOCKSEARCH: [u64; 4] = [SBLOCK_UFS2, SBLOCK_UFS1, SBLOCK_FLOPPY, SBLOCK_PIGGY];
pub const SBLOCKSIZE: usize = 8192;
/// Techo para `fs_sbsize`.
pub const SBSIZE: i32 = 8192;

pub const DEV_BSIZE: i64 = 512;
pub const MINBSIZE: i32 = 4096;
pub const MAXBSIZE: i32 = 65536;
pub const MAXFRAG: i32 = 8;

pub const NDADDR: usize = 12;
pub const NIADDR: usize = 3;

pub const WINO: Ino = 1;
pub const ROOTINO: Ino = 2;

pub const FS_42POSTBLFMT: i32 = -1;
pub const FS_DYNAMICPOSTBLFMT: i32 = 1;
pub const FS_42INODEFMT: i32 = -1;
pub const FS_44INODEFMT: i32 = 2;
/// Número de posiciones rotacionales del formato estático.
pub const NRPOS: i32 = 8;
pub const MAXCPG_STATIC: i32 = 32;

pub const FS_ISCLEAN: i8 = 1;
/// En UFS1: los campos de 64 bits están al día.
pub const FS_FLAGS_UPDATED: u32 = 0x80;

/// Tamaño de un `struct csum` de 32 bits en la tabla de resumen.
pub const CSUM_SIZE: usize = 16;

// Offsets dentro del superblock en disco.
mod off {
    pub const SBLKNO: usize = 8;
    pub const CBLKNO: usize = 12;
    pub const IBLKNO: usize = 16;
    pub const DBLKNO: usize = 20;
    pub const CGOFFSET: usize = 24;
    pub const CGMASK: usize = 28;
    pub const FFS1_TIME: usize = 32;
    pub const FFS1_SIZE: usize = 36;
    pub const FFS1_DSIZE: usize = 40;
    pub const NCG: usize = 44;
    pub const BSIZE: usize = 48;
    pub const FSIZE: usize = 52;
    pub const FRAG: usize = 56;
    pub const MINFREE: usize = 60;
    pub const BMASK: usize = 72;
    pub const FMASK: usize = 76;
    pub const BSHIFT: usize = 80;
    pub const FSHIFT: usize = 84;
    pub const MAXCONTIG: usize = 88;
    pub const MAXBPG: usize = 92;
    pub const FRAGSHIFT: usize = 96;
    pub const FSBTODB: usize = 100;
    pub const SBSIZE: usize = 104;
    pub const NINDIR: usize = 116;
    pub const INOPB: usize = 120;
    pub const NSPF: usize = 124;
    pub const OPTIM: usize = 128;
    pub const FFS1_CSADDR: usize = 152;
    pub const CSSIZE: usize = 156;
    pub const CGSIZE: usize = 160;
    pub const NTRAK: usize = 164;
    pub const NSECT: usize = 168;
    pub const SPC: usize = 172;
    pub const NCYL: usize = 176;
    pub const CPG: usize = 180;
    pub const IPG: usize = 184;
    pub const FPG: usize = 188;
    pub const FFS1_CSTOTAL: usize = 192;
    pub const FMOD: usize = 208;
    pub const CLEAN: usize = 209;
    pub const RONLY: usize = 210;
    pub const FFS1_FLAGS: usize = 211;
    pub const MAXBSIZE: usize = 860;
    pub const SBLOCKLOC: usize = 1000;
    pub const CSTOTAL: usize = 1008;
    pub const TIME: usize = 1072;
    pub const SIZE: usize = 1080;
    pub const DSIZE: usize = 1088;
    pub const CSADDR: usize = 1096;
    pub const FLAGS: usize = 1308;
    pub const CONTIGSUMSIZE: usize = 1316;
    pub const MAXSYMLINKLEN: usize = 1320;
    pub const INODEFMT: usize = 1324;
    pub const MAXFILESIZE: usize = 1328;
    pub const QBMASK: usize = 1336;
    pub const QFMASK: usize = 1344;
    pub const STATE: usize = 1352;
    pub const POSTBLFORMAT: usize = 1356;
    pub const NRPOS: usize = 1360;
    pub const POSTBLOFF: usize = 1364;
    pub const ROTBLOFF: usize = 1368;
    pub const MAGIC: usize = 1372;
    pub const SPACE: usize = 1376;
}

/// Bytes mínimos que debe tener un superblock para poder decodificarlo.
pub const SUPERBLOCK_MIN_LEN: usize = off::SPACE;
/// Inicio de las tablas rotacionales estáticas dentro del superblock.
pub const SUPERBLOCK_SPACE_OFF: usize = off::SPACE;

// -----------------------------------------------------------------------------
// Lectura/escritura little-endian
// -----------------------------------------------------------------------------

pub(crate) fn get_u16(b: &[u8], at: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[at..at + 2]);
    u16::from_le_bytes(a)
}

pub(crate) fn get_i16(b: &[u8], at: usize) -> i16 {
    get_u16(b, at) as i16
}

pub(crate) fn get_u32(b: &[u8], at: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(a)
}

pub(crate) fn get_i32(b: &[u8], at: usize) -> i32 {
    get_u32(b, at) as i32
}

pub(crate) fn get_i64(b: &[u8], at: usize) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[at..at + 8]);
    i64::from_le_bytes(a)
}

pub(crate) fn put_u16(b: &mut [u8], at: usize, v: u16) {
    b[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i16(b: &mut [u8], at: usize, v: i16) {
    put_u16(b, at, v as u16);
}

pub(crate) fn put_u32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i32(b: &mut [u8], at: usize, v: i32) {
    put_u32(b, at, v as u32);
}

pub(crate) fn put_i64(b: &mut [u8], at: usize, v: i64) {
    b[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn howmany(x: i64, y: i64) -> i64 {
    (x + y - 1) / y
}

// -----------------------------------------------------------------------------
// Estructuras en memoria
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SuperblockError {
    #[error("no se encontró ningún superblock utilizable")]
    NotFound,
    #[error("magic inválido ({0:#x})")]
    BadMagic(i32),
    #[error("{field} fuera de rango ({value})")]
    Sanity { field: &'static str, value: i64 },
    #[error("el superblock alternativo no coincide con el primario ({0})")]
    AltMismatch(&'static str),
    #[error("superblock demasiado corto ({0} bytes)")]
    Truncated(usize),
    #[error("error de E/S leyendo el superblock en {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UfsVersion {
    Ufs1,
    Ufs2,
}

/// Resumen por grupo (`struct csum`), tal como vive en la tabla `fs_csaddr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Csum {
    pub ndir: i32,
    pub nbfree: i32,
    pub nifree: i32,
    pub nffree: i32,
}

impl Csum {
    pub fn decode(b: &[u8]) -> Self {
        Self {
            ndir: get_i32(b, 0),
            nbfree: get_i32(b, 4),
            nifree: get_i32(b, 8),
            nffree: get_i32(b, 12),
        }
    }

    pub fn encode(&self, b: &mut [u8]) {
        put_i32(b, 0, self.ndir);
        put_i32(b, 4, self.nbfree);
        put_i32(b, 8, self.nifree);
        put_i32(b, 12, self.nffree);
    }
}

/// Totales globales del sistema de archivos.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsumTotal {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
}

impl CsumTotal {
    pub fn add(&mut self, cs: &Csum) {
        self.ndir += i64::from(cs.ndir);
        self.nbfree += i64::from(cs.nbfree);
        self.nifree += i64::from(cs.nifree);
        self.nffree += i64::from(cs.nffree);
    }
}

/// Vista lógica del superblock. Las variantes UFS1 (campos de 32 bits) y UFS2
/// (campos de 64 bits) se normalizan aquí al cargar.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: UfsVersion,
    pub magic: i32,
    pub sblockloc: i64,
    pub sblkno: i32,
    pub cblkno: i32,
    pub iblkno: i32,
    pub dblkno: i32,
    pub cgoffset: i32,
    pub cgmask: i32,
    pub time: i64,
    pub size: i64,
    pub dsize: i64,
    pub ncg: i32,
    pub bsize: i32,
    pub fsize: i32,
    pub frag: i32,
    pub minfree: i32,
    pub bmask: i32,
    pub fmask: i32,
    pub bshift: i32,
    pub fshift: i32,
    pub maxcontig: i32,
    pub maxbpg: i32,
    pub fragshift: i32,
    pub fsbtodb: i32,
    pub sbsize: i32,
    pub nindir: i32,
    pub inopb: i32,
    pub nspf: i32,
    pub optim: i32,
    pub csaddr: i64,
    pub cssize: i32,
    pub cgsize: i32,
    pub ntrak: i32,
    pub nsect: i32,
    pub spc: i32,
    pub ncyl: i32,
    pub cpg: i32,
    pub ipg: i32,
    pub fpg: i32,
    pub cstotal: CsumTotal,
    pub fmod: i8,
    pub clean: i8,
    pub ronly: i8,
    pub flags: u32,
    pub maxbsize: i32,
    pub contigsumsize: i32,
    pub maxsymlinklen: i32,
    pub inodefmt: i32,
    pub maxfilesize: u64,
    pub qbmask: i64,
    pub qfmask: i64,
    pub state: i32,
    pub postblformat: i32,
    pub nrpos: i32,
    pub postbloff: i32,
    pub rotbloff: i32,
    /// Copia cruda: lo que no se decodifica se preserva al reescribir.
    raw: Vec<u8>,
}

impl Superblock {
    /// Decodifica un superblock a partir de sus bytes. Sólo valida el magic;
    /// las comprobaciones de coherencia viven en `fsck::setup`.
    pub fn decode(buf: &[u8]) -> Result<Self, SuperblockError> {
        if buf.len() < SUPERBLOCK_MIN_LEN {
            return Err(SuperblockError::Truncated(buf.len()));
        }
        let magic = get_i32(buf, off::MAGIC);
        let version = match magic {
            FS_UFS1_MAGIC => UfsVersion::Ufs1,
            FS_UFS2_MAGIC => UfsVersion::Ufs2,
            other => return Err(SuperblockError::BadMagic(other)),
        };

        let ffs1_flags = buf[off::FFS1_FLAGS];
        let updated = version == UfsVersion::Ufs2 || u32::from(ffs1_flags) & FS_FLAGS_UPDATED != 0;

        let (time, size, dsize, csaddr, cstotal, flags) = if updated {
            (
                get_i64(buf, off::TIME),
                get_i64(buf, off::SIZE),
                get_i64(buf, off::DSIZE),
                get_i64(buf, off::CSADDR),
                CsumTotal {
                    ndir: get_i64(buf, off::CSTOTAL),
                    nbfree: get_i64(buf, off::CSTOTAL + 8),
                    nifree: get_i64(buf, off::CSTOTAL + 16),
                    nffree: get_i64(buf, off::CSTOTAL + 24),
                },
                if version == UfsVersion::Ufs2 {
                    get_u32(buf, off::FLAGS)
                } else {
                    get_u32(buf, off::FLAGS) | u32::from(ffs1_flags)
                },
            )
        } else {
            // UFS1 heredado: sólo los campos de 32 bits son fiables.
            let cs = Csum::decode(&buf[off::FFS1_CSTOTAL..off::FFS1_CSTOTAL + CSUM_SIZE]);
            let mut total = CsumTotal::default();
            total.add(&cs);
            (
                i64::from(get_i32(buf, off::FFS1_TIME)),
                i64::from(get_i32(buf, off::FFS1_SIZE)),
                i64::from(get_i32(buf, off::FFS1_DSIZE)),
                i64::from(get_i32(buf, off::FFS1_CSADDR)),
                total,
                u32::from(ffs1_flags),
            )
        };

        let bsize = get_i32(buf, off::BSIZE);
        let sblockloc = if version == UfsVersion::Ufs2 {
            get_i64(buf, off::SBLOCKLOC)
        } else {
            SBLOCK_UFS1 as i64
        };
        let maxbsize = match get_i32(buf, off::MAXBSIZE) {
            0 => bsize,
            v => v,
        };

        Ok(Self {
            version,
            magic,
            sblockloc,
            sblkno: get_i32(buf, off::SBLKNO),
            cblkno: get_i32(buf, off::CBLKNO),
            iblkno: get_i32(buf, off::IBLKNO),
            dblkno: get_i32(buf, off::DBLKNO),
            cgoffset: get_i32(buf, off::CGOFFSET),
            cgmask: get_i32(buf, off::CGMASK),
            time,
            size,
            dsize,
            ncg: get_i32(buf, off::NCG),
            bsize,
            fsize: get_i32(buf, off::FSIZE),
            frag: get_i32(buf, off::FRAG),
            minfree: get_i32(buf, off::MINFREE),
            bmask: get_i32(buf, off::BMASK),
            fmask: get_i32(buf, off::FMASK),
            bshift: get_i32(buf, off::BSHIFT),
            fshift: get_i32(buf, off::FSHIFT),
            maxcontig: get_i32(buf, off::MAXCONTIG),
            maxbpg: get_i32(buf, off::MAXBPG),
            fragshift: get_i32(buf, off::FRAGSHIFT),
            fsbtodb: get_i32(buf, off::FSBTODB),
            sbsize: get_i32(buf, off::SBSIZE),
            nindir: get_i32(buf, off::NINDIR),
            inopb: get_i32(buf, off::INOPB),
            nspf: get_i32(buf, off::NSPF),
            optim: get_i32(buf, off::OPTIM),
            csaddr,
            cssize: get_i32(buf, off::CSSIZE),
            cgsize: get_i32(buf, off::CGSIZE),
            ntrak: get_i32(buf, off::NTRAK),
            nsect: get_i32(buf, off::NSECT),
            spc: get_i32(buf, off::SPC),
            ncyl: get_i32(buf, off::NCYL),
            cpg: get_i32(buf, off::CPG),
            ipg: get_i32(buf, off::IPG),
            fpg: get_i32(buf, off::FPG),
            cstotal,
            fmod: buf[off::FMOD] as i8,
            clean: buf[off::CLEAN] as i8,
            ronly: buf[off::RONLY] as i8,
            flags,
            maxbsize,
            contigsumsize: get_i32(buf, off::CONTIGSUMSIZE),
            maxsymlinklen: get_i32(buf, off::MAXSYMLINKLEN),
            inodefmt: get_i32(buf, off::INODEFMT),
            maxfilesize: get_i64(buf, off::MAXFILESIZE) as u64,
            qbmask: get_i64(buf, off::QBMASK),
            qfmask: get_i64(buf, off::QFMASK),
            state: get_i32(buf, off::STATE),
            postblformat: get_i32(buf, off::POSTBLFORMAT),
            nrpos: get_i32(buf, off::NRPOS),
            postbloff: get_i32(buf, off::POSTBLOFF),
            rotbloff: get_i32(buf, off::ROTBLOFF),
            raw: buf.to_vec(),
        })
    }

    /// Serializa el superblock sobre su copia cruda y la devuelve. UFS1 escribe
    /// siempre los campos de 32 bits, y además los de 64 si ya estaban al día.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = self.raw.clone();
        if b.len() < SUPERBLOCK_MIN_LEN {
            b.resize(SUPERBLOCK_MIN_LEN, 0);
        }
        put_i32(&mut b, off::SBLKNO, self.sblkno);
        put_i32(&mut b, off::CBLKNO, self.cblkno);
        put_i32(&mut b, off::IBLKNO, self.iblkno);
        put_i32(&mut b, off::DBLKNO, self.dblkno);
        put_i32(&mut b, off::CGOFFSET, self.cgoffset);
        put_i32(&mut b, off::CGMASK, self.cgmask);
        put_i32(&mut b, off::NCG, self.ncg);
        put_i32(&mut b, off::BSIZE, self.bsize);
        put_i32(&mut b, off::FSIZE, self.fsize);
        put_i32(&mut b, off::FRAG, self.frag);
        put_i32(&mut b, off::MINFREE, self.minfree);
        put_i32(&mut b, off::BMASK, self.bmask);
        put_i32(&mut b, off::FMASK, self.fmask);
        put_i32(&mut b, off::BSHIFT, self.bshift);
        put_i32(&mut b, off::FSHIFT, self.fshift);
        put_i32(&mut b, off::MAXCONTIG, self.maxcontig);
        put_i32(&mut b, off::MAXBPG, self.maxbpg);
        put_i32(&mut b, off::FRAGSHIFT, self.fragshift);
        put_i32(&mut b, off::FSBTODB, self.fsbtodb);
        put_i32(&mut b, off::SBSIZE, self.sbsize);
        put_i32(&mut b, off::NINDIR, self.nindir);
        put_i32(&mut b, off::INOPB, self.inopb);
        put_i32(&mut b, off::NSPF, self.nspf);
        put_i32(&mut b, off::OPTIM, self.optim);
        put_i32(&mut b, off::CSSIZE, self.cssize);
        put_i32(&mut b, off::CGSIZE, self.cgsize);
        put_i32(&mut b, off::NTRAK, self.ntrak);
        put_i32(&mut b, off::NSECT, self.nsect);
        put_i32(&mut b, off::SPC, self.spc);
        put_i32(&mut b, off::NCYL, self.ncyl);
        put_i32(&mut b, off::CPG, self.cpg);
        put_i32(&mut b, off::IPG, self.ipg);
        put_i32(&mut b, off::FPG, self.fpg);
        b[off::FMOD] = self.fmod as u8;
        b[off::CLEAN] = self.clean as u8;
        b[off::RONLY] = self.ronly as u8;
        put_i32(&mut b, off::CONTIGSUMSIZE, self.contigsumsize);
        put_i32(&mut b, off::MAXSYMLINKLEN, self.maxsymlinklen);
        put_i32(&mut b, off::INODEFMT, self.inodefmt);
        put_i64(&mut b, off::MAXFILESIZE, self.maxfilesize as i64);
        put_i64(&mut b, off::QBMASK, self.qbmask);
        put_i64(&mut b, off::QFMASK, self.qfmask);
        put_i32(&mut b, off::STATE, self.state);
        put_i32(&mut b, off::POSTBLFORMAT, self.postblformat);
        put_i32(&mut b, off::NRPOS, self.nrpos);
        put_i32(&mut b, off::POSTBLOFF, self.postbloff);
        put_i32(&mut b, off::ROTBLOFF, self.rotbloff);
        put_i32(&mut b, off::MAGIC, self.magic);
        put_i32(&mut b, off::MAXBSIZE, self.maxbsize);

        let updated = self.version == UfsVersion::Ufs2 || self.flags & FS_FLAGS_UPDATED != 0;
        if self.version == UfsVersion::Ufs1 {
            put_i32(&mut b, off::FFS1_TIME, self.time as i32);
            put_i32(&mut b, off::FFS1_SIZE, self.size as i32);
            put_i32(&mut b, off::FFS1_DSIZE, self.dsize as i32);
            put_i32(&mut b, off::FFS1_CSADDR, self.csaddr as i32);
            let cs = Csum {
                ndir: self.cstotal.ndir as i32,
                nbfree: self.cstotal.nbfree as i32,
                nifree: self.cstotal.nifree as i32,
                nffree: self.cstotal.nffree as i32,
            };
            cs.encode(&mut b[off::FFS1_CSTOTAL..off::FFS1_CSTOTAL + CSUM_SIZE]);
            b[off::FFS1_FLAGS] = (self.flags & 0xff) as u8;
        }
        if updated {
            if self.version == UfsVersion::Ufs2 {
                put_i64(&mut b, off::SBLOCKLOC, self.sblockloc);
            }
            put_i64(&mut b, off::TIME, self.time);
            put_i64(&mut b, off::SIZE, self.size);
            put_i64(&mut b, off::DSIZE, self.dsize);
            put_i64(&mut b, off::CSADDR, self.csaddr);
            put_i64(&mut b, off::CSTOTAL, self.cstotal.ndir);
            put_i64(&mut b, off::CSTOTAL + 8, self.cstotal.nbfree);
            put_i64(&mut b, off::CSTOTAL + 16, self.cstotal.nifree);
            put_i64(&mut b, off::CSTOTAL + 24, self.cstotal.nffree);
            put_u32(&mut b, off::FLAGS, self.flags);
        }
        b
    }

    /// Construye un superblock vacío de `sbsize` bytes (usado por mkfs).
    pub fn blank(version: UfsVersion, sbsize: usize) -> Self {
        let mut raw = vec![0u8; sbsize.max(SUPERBLOCK_MIN_LEN)];
        let magic = match version {
            UfsVersion::Ufs1 => FS_UFS1_MAGIC,
            UfsVersion::Ufs2 => FS_UFS2_MAGIC,
        };
        put_i32(&mut raw, off::MAGIC, magic);
        // El magic ya está puesto, la decodificación no puede fallar.
        match Self::decode(&raw) {
            Ok(sb) => sb,
            Err(_) => unreachable!("superblock en blanco con magic válido"),
        }
    }

    pub fn is_ufs2(&self) -> bool {
        self.version == UfsVersion::Ufs2
    }

    /// Formato dinámico (autodescriptivo) de grupos de cilindros.
    pub fn dynamic_cg(&self) -> bool {
        self.is_ufs2() || self.postblformat != FS_42POSTBLFMT
    }

    pub fn new_inode_format(&self) -> bool {
        self.is_ufs2() || self.inodefmt >= FS_44INODEFMT
    }

    // ----- geometría -----

    pub fn cgbase(&self, c: i64) -> Daddr {
        i64::from(self.fpg) * c
    }

    pub fn cgstart(&self, c: i64) -> Daddr {
        if self.is_ufs2() {
            self.cgbase(c)
        } else {
            self.cgbase(c) + i64::from(self.cgoffset) * (c & !i64::from(self.cgmask))
        }
    }

    pub fn cgsblock(&self, c: i64) -> Daddr {
        self.cgstart(c) + i64::from(self.sblkno)
    }

    pub fn cgtod(&self, c: i64) -> Daddr {
        self.cgstart(c) + i64::from(self.cblkno)
    }

    pub fn cgimin(&self, c: i64) -> Daddr {
        self.cgstart(c) + i64::from(self.iblkno)
    }

    pub fn cgdmin(&self, c: i64) -> Daddr {
        self.cgstart(c) + i64::from(self.dblkno)
    }

    pub fn dtog(&self, d: Daddr) -> i64 {
        d / i64::from(self.fpg)
    }

    pub fn dtogd(&self, d: Daddr) -> i64 {
        d % i64::from(self.fpg)
    }

    pub fn ino_to_cg(&self, ino: Ino) -> i64 {
        i64::from(ino) / i64::from(self.ipg)
    }

    pub fn ino_to_fsba(&self, ino: Ino) -> Daddr {
        let c = self.ino_to_cg(ino);
        let within = i64::from(ino) % i64::from(self.ipg);
        self.cgimin(c) + self.blkstofrags(within / i64::from(self.inopb))
    }

    pub fn ino_to_fsbo(&self, ino: Ino) -> usize {
        (i64::from(ino) % i64::from(self.inopb)) as usize
    }

    pub fn blkstofrags(&self, blks: i64) -> Daddr {
        blks << self.fragshift
    }

    pub fn fragstoblks(&self, frags: i64) -> i64 {
        frags >> self.fragshift
    }

    pub fn numfrags(&self, bytes: i64) -> i64 {
        bytes >> self.fshift
    }

    pub fn fragnum(&self, d: Daddr) -> i64 {
        d % i64::from(self.frag)
    }

    pub fn blknum(&self, d: Daddr) -> Daddr {
        d - self.fragnum(d)
    }

    pub fn lblkno(&self, loc: i64) -> i64 {
        loc >> self.bshift
    }

    pub fn blkoff(&self, loc: i64) -> i64 {
        loc & (i64::from(self.bsize) - 1)
    }

    pub fn fragroundup(&self, size: i64) -> i64 {
        let f = i64::from(self.fsize);
        (size + f - 1) & !(f - 1)
    }

    /// Tamaño en bytes del bloque lógico `lbn` de un archivo de `size` bytes.
    pub fn blksize(&self, size: u64, lbn: i64) -> i64 {
        let size = size as i64;
        if lbn >= NDADDR as i64 || size >= (lbn + 1) << self.bshift {
            i64::from(self.bsize)
        } else {
            self.fragroundup(self.blkoff(size))
        }
    }

    /// Fragmentos a unidades `DEV_BSIZE` del dispositivo.
    pub fn fsbtodb(&self, d: Daddr) -> i64 {
        d << self.fsbtodb
    }

    /// Bytes a unidades `DEV_BSIZE`.
    pub fn btodb(&self, bytes: i64) -> i64 {
        bytes / DEV_BSIZE
    }

    pub fn byte_offset(&self, d: Daddr) -> u64 {
        (d as u64) * self.fsize as u64
    }

    /// Fragmentos ocupados por la tabla de resumen.
    pub fn cs_frags(&self) -> i64 {
        howmany(i64::from(self.cssize), i64::from(self.fsize))
    }

    pub fn maxino(&self) -> u64 {
        self.ncg as u64 * self.ipg as u64
    }

    /// Tamaño en disco de un inodo.
    pub fn inode_size(&self) -> usize {
        match self.version {
            UfsVersion::Ufs1 => crate::inode::UFS1_DINODE_SIZE,
            UfsVersion::Ufs2 => crate::inode::UFS2_DINODE_SIZE,
        }
    }

    /// Cilindro (dentro del grupo) del bloque en el fragmento relativo `bno`.
    pub fn cbtocylno(&self, bno: i64) -> usize {
        if self.spc <= 0 {
            return 0;
        }
        (self.fsbtodb(bno) / i64::from(self.spc)) as usize
    }

    /// Posición rotacional del bloque en el fragmento relativo `bno`.
    pub fn cbtorpos(&self, bno: i64) -> usize {
        if self.nrpos <= 1 || self.nsect <= 0 || self.spc <= 0 {
            return 0;
        }
        let sect = self.fsbtodb(bno) % i64::from(self.spc) % i64::from(self.nsect);
        (sect * i64::from(self.nrpos) / i64::from(self.nsect)) as usize
    }
}

/// Tamaño máximo de archivo que admite la geometría: bloques directos más el
/// abanico de cada nivel de indirección.
pub fn max_file_size(bsize: i32, nindir: i32) -> u64 {
    let bsize = bsize.max(0) as u128;
    let nindir = nindir.max(0) as u128;
    let mut max = bsize * NDADDR as u128 - 1;
    let mut sizepb = bsize;
    for _ in 0..NIADDR {
        sizepb = sizepb.saturating_mul(nindir);
        max = max.saturating_add(sizepb);
    }
    u64::try_from(max).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_file_size_matches_geometry() {
        // 8K bloques, 2048 punteros de 4 bytes por bloque indirecto.
        let m = max_file_size(8192, 2048);
        let expect = 8192u128 * 12 - 1
            + 8192u128 * 2048
            + 8192u128 * 2048 * 2048
            + 8192u128 * 2048 * 2048 * 2048;
        assert_eq!(m as u128, expect);
    }

    #[test]
    fn huge_geometry_saturates() {
        // 64K bloques todavía caben en 64 bits.
        let big = 65536u128 * 12 - 1 + 65536u128 * 8192 + 65536u128 * 8192 * 8192 + 65536u128 * 8192 * 8192 * 8192;
        assert_eq!(max_file_size(65536, 8192) as u128, big);
        assert_eq!(max_file_size(i32::MAX, i32::MAX), u64::MAX);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; SBLOCKSIZE];
        assert!(matches!(
            Superblock::decode(&buf),
            Err(SuperblockError::BadMagic(0))
        ));
    }

    #[test]
    fn blank_roundtrips_through_encode() {
        let mut sb = Superblock::blank(UfsVersion::Ufs2, SBLOCKSIZE);
        sb.ncg = 3;
        sb.size = 1 << 33;
        sb.cstotal.nbfree = 77;
        let again = Superblock::decode(&sb.encode()).unwrap();
        assert_eq!(again.ncg, 3);
        assert_eq!(again.size, 1 << 33);
        assert_eq!(again.cstotal.nbfree, 77);
    }

    #[test]
    fn legacy_ufs1_uses_32bit_fields() {
        let mut sb = Superblock::blank(UfsVersion::Ufs1, SBLOCKSIZE);
        sb.size = 4096;
        sb.csaddr = 40;
        let raw = sb.encode();
        assert_eq!(get_i32(&raw, off::FFS1_SIZE), 4096);
        assert_eq!(get_i64(&raw, off::SIZE), 0);
        let again = Superblock::decode(&raw).unwrap();
        assert_eq!(again.size, 4096);
        assert_eq!(again.csaddr, 40);
    }
}
