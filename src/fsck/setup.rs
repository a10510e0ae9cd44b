/*Arranque de la revisión: busca un superbloque utilizable, lo compara con
la copia del último grupo, corrige los campos derivados y reserva las
tablas de la corrida. Si algo no se puede reservar la corrida no empieza.*/

use tracing::{debug, info, warn};

use crate::cg::{cg_header_size, CgFormat};
use crate::dir::DirFormat;
use crate::fs::{
    howmany, max_file_size, Csum, Superblock, SuperblockError, UfsVersion, CSUM_SIZE, DEV_BSIZE,
    FS_DYNAMICPOSTBLFMT, FS_ISCLEAN, MAXBSIZE, MAXFRAG, MINBSIZE, NDADDR, NIADDR, NRPOS, SBLOCKSEARCH,
    SBLOCKSIZE, SBLOCK_UFS2, SBSIZE,
};
use crate::inode::Geometry;

use super::dirtree::DirTree;
use super::error::{FsckError, Result};
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::{alloc_table, BlockMap, InodeStatus};
use super::prompt::{PreenPolicy, Question};

fn bad(field: &'static str, value: impl Into<i64>) -> SuperblockError {
    SuperblockError::Sanity {
        field,
        value: value.into(),
    }
}

fn log2(v: i64) -> i64 {
    i64::from(v.trailing_zeros())
}

fn pow2(v: i64) -> bool {
    v > 0 && v & (v - 1) == 0
}

/// Coherencia interna del superbloque: tamaños, desplazamientos, máscaras y
/// el orden de las áreas dentro de cada grupo.
pub(crate) fn check_superblock(sb: &Superblock) -> Result<(), SuperblockError> {
    let ncg = i64::from(sb.ncg);
    let bsize = i64::from(sb.bsize);
    let fsize = i64::from(sb.fsize);
    let fpg = i64::from(sb.fpg);

    if ncg < 1 {
        return Err(bad("ncg", ncg));
    }
    if !sb.is_ufs2() {
        let cpg = i64::from(sb.cpg);
        if cpg < 1 {
            return Err(bad("cpg", cpg));
        }
        let ncyl = i64::from(sb.ncyl);
        if ncyl < cpg * (ncg - 1) || ncyl > cpg * ncg {
            return Err(bad("ncyl", ncyl));
        }
    }
    if sb.sbsize <= 0 || sb.sbsize > SBSIZE {
        return Err(bad("sbsize", sb.sbsize));
    }
    if bsize < i64::from(MINBSIZE) || bsize > i64::from(MAXBSIZE) || !pow2(bsize) {
        return Err(bad("bsize", bsize));
    }
    if fsize < DEV_BSIZE || !pow2(fsize) || fsize > bsize || bsize / fsize > i64::from(MAXFRAG) {
        return Err(bad("fsize", fsize));
    }
    let frag = bsize / fsize;
    if i64::from(sb.frag) != frag {
        return Err(bad("frag", sb.frag));
    }
    if i64::from(sb.bshift) != log2(bsize) || i64::from(sb.bmask) != !(bsize - 1) {
        return Err(bad("bshift", sb.bshift));
    }
    if i64::from(sb.fshift) != log2(fsize) || i64::from(sb.fmask) != !(fsize - 1) {
        return Err(bad("fshift", sb.fshift));
    }
    if i64::from(sb.fragshift) != log2(frag) {
        return Err(bad("fragshift", sb.fragshift));
    }
    if i64::from(sb.fsbtodb) != log2(fsize / DEV_BSIZE) {
        return Err(bad("fsbtodb", sb.fsbtodb));
    }
    if i64::from(sb.inopb) != bsize / sb.inode_size() as i64 {
        return Err(bad("inopb", sb.inopb));
    }
    let ptr = if sb.is_ufs2() { 8 } else { 4 };
    if i64::from(sb.nindir) != bsize / ptr {
        return Err(bad("nindir", sb.nindir));
    }
    if sb.ipg <= 0 {
        return Err(bad("ipg", sb.ipg));
    }
    if fpg <= 0 || fpg % frag != 0 {
        return Err(bad("fpg", fpg));
    }

    let (sblkno, cblkno, iblkno, dblkno) = (
        i64::from(sb.sblkno),
        i64::from(sb.cblkno),
        i64::from(sb.iblkno),
        i64::from(sb.dblkno),
    );
    if sblkno < 0 || cblkno <= sblkno {
        return Err(bad("cblkno", cblkno));
    }
    if iblkno <= cblkno {
        return Err(bad("iblkno", iblkno));
    }
    if dblkno <= iblkno || dblkno > fpg {
        return Err(bad("dblkno", dblkno));
    }
    if iblkno + howmany(i64::from(sb.ipg), i64::from(sb.inopb)) * frag > dblkno {
        return Err(bad("ipg", sb.ipg));
    }
    if sb.size <= fpg * (ncg - 1) || sb.size > fpg * ncg {
        return Err(bad("size", sb.size));
    }
    if sb.cssize <= 0 || i64::from(sb.cssize) < ncg * CSUM_SIZE as i64 {
        return Err(bad("cssize", sb.cssize));
    }
    if sb.csaddr <= 0 || sb.csaddr + sb.cs_frags() > sb.size {
        return Err(bad("csaddr", sb.csaddr));
    }
    let format = if sb.dynamic_cg() {
        CgFormat::Dynamic
    } else {
        CgFormat::Static
    };
    if sb.cgsize <= 0 || sb.cgsize > sb.bsize || cg_header_size(sb, format) > sb.cgsize as usize {
        return Err(bad("cgsize", sb.cgsize));
    }
    Ok(())
}

/// Campos que deben coincidir entre el superbloque y sus copias.
fn stable_fields(sb: &Superblock) -> [(&'static str, i64); 24] {
    [
        ("sblkno", sb.sblkno.into()),
        ("cblkno", sb.cblkno.into()),
        ("iblkno", sb.iblkno.into()),
        ("dblkno", sb.dblkno.into()),
        ("cgoffset", sb.cgoffset.into()),
        ("cgmask", sb.cgmask.into()),
        ("ncg", sb.ncg.into()),
        ("bsize", sb.bsize.into()),
        ("fsize", sb.fsize.into()),
        ("frag", sb.frag.into()),
        ("bmask", sb.bmask.into()),
        ("fmask", sb.fmask.into()),
        ("bshift", sb.bshift.into()),
        ("fshift", sb.fshift.into()),
        ("fragshift", sb.fragshift.into()),
        ("fsbtodb", sb.fsbtodb.into()),
        ("sbsize", sb.sbsize.into()),
        ("nindir", sb.nindir.into()),
        ("inopb", sb.inopb.into()),
        ("cssize", sb.cssize.into()),
        ("cpg", sb.cpg.into()),
        ("ipg", sb.ipg.into()),
        ("fpg", sb.fpg.into()),
        ("magic", sb.magic.into()),
    ]
}

fn compare_copies(sb: &Superblock, alt: &Superblock) -> Result<(), SuperblockError> {
    for ((field, a), (_, b)) in stable_fields(sb).into_iter().zip(stable_fields(alt)) {
        if a != b {
            return Err(SuperblockError::AltMismatch(field));
        }
    }
    Ok(())
}

/// Geometría mínima para ubicar las copias de los grupos.
fn usable_as_guide(sb: &Superblock) -> bool {
    sb.ncg > 0
        && sb.fpg > 0
        && sb.sblkno >= 0
        && pow2(i64::from(sb.fsize))
        && i64::from(sb.fsize) >= DEV_BSIZE
        && (sb.is_ufs2() || sb.cgmask != 0)
}

impl<D: Device> Fsck<D> {
    fn read_sb_at(&mut self, offset: u64) -> Result<Superblock, SuperblockError> {
        let avail = self.cache.dev_len().saturating_sub(offset);
        if avail < SBLOCKSIZE as u64 {
            return Err(SuperblockError::Truncated(avail as usize));
        }
        let mut buf = vec![0u8; SBLOCKSIZE];
        self.cache
            .device_mut()
            .read_at(offset, &mut buf)
            .map_err(|source| SuperblockError::Io { offset, source })?;
        Superblock::decode(&buf)
    }

    fn try_primary(&mut self, offset: u64) -> Result<Superblock, SuperblockError> {
        let sb = self.read_sb_at(offset)?;
        match sb.version {
            UfsVersion::Ufs2 if sb.sblockloc != offset as i64 => {
                return Err(bad("sblockloc", sb.sblockloc));
            }
            UfsVersion::Ufs1 if offset == SBLOCK_UFS2 => {
                return Err(bad("sblockloc", offset as i64));
            }
            _ => {}
        }
        check_superblock(&sb)?;
        let last = i64::from(sb.ncg) - 1;
        let at = sb.byte_offset(sb.cgsblock(last));
        let alt = self.read_sb_at(at).map_err(|e| {
            debug!(error = %e, "copia del último grupo ilegible");
            SuperblockError::AltMismatch("magic")
        })?;
        compare_copies(&sb, &alt)?;
        Ok(sb)
    }

    /// Recorre las copias de cada grupo, ubicadas con la geometría del primer
    /// superbloque legible.
    fn scan_group_copies(&mut self) -> Option<(Superblock, u64)> {
        for &offset in SBLOCKSEARCH.iter() {
            let Ok(guide) = self.read_sb_at(offset) else { continue };
            if !usable_as_guide(&guide) {
                continue;
            }
            for c in 0..i64::from(guide.ncg) {
                let at = guide.byte_offset(guide.cgsblock(c));
                if at == offset {
                    continue;
                }
                match self.read_sb_at(at) {
                    Ok(sb) if check_superblock(&sb).is_ok() => return Some((sb, at)),
                    Ok(_) | Err(_) => debug!(cg = c, "copia del grupo descartada"),
                }
            }
        }
        None
    }

    fn find_superblock(&mut self) -> Result<(Superblock, u64)> {
        if let Some(blk) = self.opts.alt_sblock {
            let offset = blk as u64 * DEV_BSIZE as u64;
            let sb = self.read_sb_at(offset)?;
            check_superblock(&sb)?;
            self.used_alt = true;
            return Ok((sb, offset));
        }

        let mut last = SuperblockError::NotFound;
        for &offset in SBLOCKSEARCH.iter() {
            match self.try_primary(offset) {
                Ok(sb) => return Ok((sb, offset)),
                Err(e) => {
                    debug!(offset, error = %e, "superbloque descartado");
                    last = e;
                }
            }
        }
        warn!(error = %last, "sin superbloque primario, buscando copias en los grupos");
        match self.scan_group_copies() {
            Some((sb, at)) => {
                self.used_alt = true;
                Ok((sb, at))
            }
            None => Err(FsckError::Superblock(last)),
        }
    }

    /// Devuelve false si no hace falta revisar (limpio, en modo preen).
    pub fn setup(&mut self) -> Result<bool> {
        self.phase(Phase::Setup);
        let (sb, offset) = self.find_superblock()?;
        info!(offset, version = ?sb.version, ncg = sb.ncg, "superbloque aceptado");
        self.sb = sb;
        self.sb_offset = offset;

        let preen = self.opts.preen();
        if !preen {
            println!("** {}", self.opts.device.display());
            if self.cache.is_readonly() {
                println!("** SOLO LECTURA (NO WRITE)");
            }
        }
        if self.used_alt {
            self.pwarn("USING ALTERNATE SUPERBLOCK", format!("AT BYTE {offset}"));
            // Nunca pasa por limpio un sistema rescatado de una copia.
            self.sb.clean = 0;
            self.sbdirty = true;
        }
        if preen && !self.opts.force && self.sb.clean & FS_ISCLEAN != 0 {
            println!("{}: file system is clean; not checking", self.opts.device.display());
            self.report.skipped = true;
            return Ok(false);
        }

        let fs_bytes = self.sb.byte_offset(self.sb.size);
        if fs_bytes > self.cache.dev_len() {
            return Err(FsckError::Fatal(format!(
                "el sistema de archivos ({fs_bytes} bytes) no cabe en el dispositivo ({} bytes)",
                self.cache.dev_len()
            )));
        }
        self.cache.set_fsize(i64::from(self.sb.fsize));

        self.check_derived_fields()?;
        self.disk_cg_format = if self.sb.dynamic_cg() {
            CgFormat::Dynamic
        } else {
            CgFormat::Static
        };
        self.cg_format = self.disk_cg_format;
        if self.opts.convert && self.disk_cg_format == CgFormat::Static {
            self.convert_cg_format()?;
        }

        self.geo = Geometry::of(&self.sb);
        self.maxino = self.sb.maxino();
        self.dirfmt = DirFormat::for_fs(&self.sb, self.opts.dir_swap);
        self.read_csums()?;
        self.alloc_tables()?;
        debug!(maxino = self.maxino, dirfmt = ?self.dirfmt, "tablas listas");
        Ok(true)
    }

    fn check_derived_fields(&mut self) -> Result<()> {
        if !(0..=99).contains(&self.sb.minfree) {
            let q = Question::new("IMPOSSIBLE MINFREE", "SET TO DEFAULT")
                .detail(format!("={} IN SUPERBLOCK", self.sb.minfree))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                self.sb.minfree = 10;
                self.sbdirty = true;
            }
        }

        let maxfilesize = max_file_size(self.sb.bsize, self.sb.nindir);
        let ptr = if self.sb.is_ufs2() { 8 } else { 4 };
        let maxsymlinklen = ((NDADDR + NIADDR) * ptr) as i32;
        let qbmask = i64::from(!self.sb.bmask);
        let qfmask = i64::from(!self.sb.fmask);

        if !self.sb.new_inode_format() {
            // Formato viejo: los campos no existen en disco.
            self.sb.maxfilesize = maxfilesize;
            self.sb.maxsymlinklen = 0;
            self.sb.qbmask = qbmask;
            self.sb.qfmask = qfmask;
            return Ok(());
        }
        if self.sb.maxfilesize != maxfilesize {
            let q = Question::new("INCORRECT MAXFILESIZE", "FIX")
                .detail(format!("={}", self.sb.maxfilesize))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                self.sb.maxfilesize = maxfilesize;
                self.sbdirty = true;
            }
        }
        if self.sb.maxsymlinklen != maxsymlinklen {
            let q = Question::new("BAD MAXSYMLINKLEN", "FIX")
                .detail(format!("={}", self.sb.maxsymlinklen))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                self.sb.maxsymlinklen = maxsymlinklen;
                self.sbdirty = true;
            }
        }
        if self.sb.qbmask != qbmask {
            let q = Question::new("INCORRECT QBMASK", "FIX")
                .detail(format!("={:#x}", self.sb.qbmask))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                self.sb.qbmask = qbmask;
                self.sbdirty = true;
            }
        }
        if self.sb.qfmask != qfmask {
            let q = Question::new("INCORRECT QFMASK", "FIX")
                .detail(format!("={:#x}", self.sb.qfmask))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                self.sb.qfmask = qfmask;
                self.sbdirty = true;
            }
        }
        Ok(())
    }

    /// Paso único de grupos estáticos a dinámicos. Los bloques se reescriben
    /// enteros en pass5.
    fn convert_cg_format(&mut self) -> Result<()> {
        let q = Question::new("CONVERT TO NEW CYLINDER GROUP FORMAT", "CONVERT").preen(PreenPolicy::Fix);
        if !self.confirm(q)? {
            return Ok(());
        }
        let mut sb = self.sb.clone();
        sb.postblformat = FS_DYNAMICPOSTBLFMT;
        sb.nrpos = NRPOS;
        let cgsize = sb.fragroundup(cg_header_size(&sb, CgFormat::Dynamic) as i64);
        if cgsize > i64::from(sb.bsize) {
            self.pwarn(
                "CANNOT CONVERT",
                format!("CYLINDER GROUP NEEDS {cgsize} BYTES, BLOCK HAS {}", sb.bsize),
            );
            return Ok(());
        }
        sb.cgsize = cgsize as i32;
        self.sb = sb;
        self.cg_format = CgFormat::Dynamic;
        self.converting = true;
        self.sbdirty = true;
        info!(cgsize, "conversión a grupos dinámicos");
        Ok(())
    }

    fn read_csums(&mut self) -> Result<()> {
        let cssize = self.sb.cssize.max(0) as usize;
        let mut raw = alloc_table(cssize, 0u8, "csum")?;
        let at = self.sb.byte_offset(self.sb.csaddr);
        if let Err(e) = self.cache.read_raw(at, &mut raw) {
            warn!(error = %e, "tabla de resúmenes ilegible");
            raw.fill(0);
            self.pfatal("BAD SUMMARY INFORMATION", format!("AT BLK {}", self.sb.csaddr))?;
            if !self.confirm(Question::new("CONTINUE", "CONTINUE"))? {
                return Err(FsckError::Aborted);
            }
        }
        let ncg = self.sb.ncg.max(0) as usize;
        let mut csums = alloc_table(ncg, Csum::default(), "csum")?;
        for (i, cs) in csums.iter_mut().enumerate() {
            let at = i * CSUM_SIZE;
            if at + CSUM_SIZE <= raw.len() {
                *cs = Csum::decode(&raw[at..at + CSUM_SIZE]);
            }
        }
        self.csums = csums;
        self.cs_raw = raw;
        Ok(())
    }

    fn alloc_tables(&mut self) -> Result<()> {
        let frag = i64::from(self.sb.frag);
        let nfrags = howmany(self.sb.size, frag) * frag;
        self.blockmap = BlockMap::try_new(nfrags as u64)?;
        let maxino = usize::try_from(self.maxino).map_err(|_| FsckError::NoMemory("inoinfo"))?;
        self.inodes = alloc_table(maxino, InodeStatus::default(), "inoinfo")?;
        let ndirs = usize::try_from(self.sb.cstotal.ndir).unwrap_or(0).max(128);
        self.dirs = DirTree::with_capacity(ndirs)?;
        self.zero_links.clear();
        self.dups.clear();
        self.n_files = 0;
        self.n_blks = 0;
        self.lost_found = 0;
        Ok(())
    }
}
