/*Sesión del fsck. Fsck guarda todo lo que comparten las pasadas: el
superbloque aceptado, la caché de bloques, el mapa de fragmentos
reconstruido, la tabla de estados de inodos, los duplicados, el árbol de
directorios y el reporte. Cada pasada vive en su propio módulo como un
bloque impl sobre este mismo tipo.*/

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::cg::CgFormat;
use crate::dir::DirFormat;
use crate::fs::{
    Csum, Ino, Superblock, UfsVersion, CSUM_SIZE, FS_ISCLEAN, SBLOCKSIZE, SBLOCK_UFS1, SBLOCK_UFS2,
};
use crate::inode::Geometry;

use super::cache::BlockCache;
use super::config::FsckOptions;
use super::dirtree::DirTree;
use super::error::{FsckError, Result};
use super::fsck_backend::Device;
use super::fsck_types::{BlockMap, DupBlocks, FsckReport, InodeStatus};
use super::prompt::{Operator, Question};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Blocks,
    Dups,
    Pathnames,
    Connectivity,
    RefCounts,
    CylGroups,
    Finish,
}

impl Phase {
    fn banner(self) -> Option<&'static str> {
        match self {
            Phase::Blocks => Some("Fase 1 - Bloques y tamaños"),
            Phase::Dups => Some("Fase 1b - Buscando más duplicados"),
            Phase::Pathnames => Some("Fase 2 - Rutas"),
            Phase::Connectivity => Some("Fase 3 - Conectividad"),
            Phase::RefCounts => Some("Fase 4 - Contadores de referencias"),
            Phase::CylGroups => Some("Fase 5 - Grupos de cilindros"),
            Phase::Setup | Phase::Finish => None,
        }
    }

    /// Los problemas de estas fases son de bloques; el resto, de inodos.
    fn about_blocks(self) -> bool {
        matches!(
            self,
            Phase::Setup | Phase::Blocks | Phase::Dups | Phase::CylGroups | Phase::Finish
        )
    }
}

pub struct Fsck<D: Device> {
    pub(crate) sb: Superblock,
    pub(crate) cache: BlockCache<D>,
    /// Tabla de resúmenes por grupo, tal como se leyó (y se corrige en pass5).
    pub(crate) csums: Vec<Csum>,
    /// Bytes crudos de la tabla de resúmenes; se reescriben sobre ellos.
    pub(crate) cs_raw: Vec<u8>,
    pub(crate) blockmap: BlockMap,
    pub(crate) inodes: Vec<InodeStatus>,
    pub(crate) dups: DupBlocks,
    /// Inodos con nlink 0 vistos en la fase 1.
    pub(crate) zero_links: HashSet<Ino>,
    pub(crate) dirs: DirTree,
    pub(crate) report: FsckReport,
    pub(crate) opts: FsckOptions,
    operator: Box<dyn Operator>,
    pub(crate) dirfmt: DirFormat,
    pub(crate) geo: Geometry,
    pub(crate) maxino: u64,
    /// Inodo de lost+found, 0 mientras no se haya buscado.
    pub(crate) lost_found: Ino,
    pub(crate) n_files: u64,
    pub(crate) n_blks: i64,
    pub(crate) sbdirty: bool,
    /// Dónde se escribe el superbloque (bytes).
    pub(crate) sb_offset: u64,
    pub(crate) used_alt: bool,
    /// Formato de grupo con el que se leen los bloques del disco.
    pub(crate) disk_cg_format: CgFormat,
    /// Formato con el que se reconstruyen (distinto si se convierte).
    pub(crate) cg_format: CgFormat,
    pub(crate) converting: bool,
    /// Inodo que recorre la fase 1; fuera de ella no se limpian punteros.
    pub(crate) truncating: Option<Ino>,
    phase: Phase,
}

pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl<D: Device> Fsck<D> {
    pub fn new(dev: D, opts: FsckOptions, operator: Box<dyn Operator>) -> Self {
        let mut cache = BlockCache::new(dev, opts.cache_blocks);
        cache.set_readonly(opts.readonly());
        let sb = Superblock::blank(UfsVersion::Ufs2, SBLOCKSIZE);
        let geo = Geometry::of(&sb);
        Self {
            sb,
            cache,
            csums: Vec::new(),
            cs_raw: Vec::new(),
            blockmap: BlockMap::default(),
            inodes: Vec::new(),
            dups: DupBlocks::default(),
            zero_links: HashSet::new(),
            dirs: DirTree::default(),
            report: FsckReport::new(),
            opts,
            operator,
            dirfmt: DirFormat::default(),
            geo,
            maxino: 0,
            lost_found: 0,
            n_files: 0,
            n_blks: 0,
            sbdirty: false,
            sb_offset: SBLOCK_UFS2,
            used_alt: false,
            disk_cg_format: CgFormat::Dynamic,
            cg_format: CgFormat::Dynamic,
            converting: false,
            truncating: None,
            phase: Phase::Setup,
        }
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn report(&self) -> &FsckReport {
        &self.report
    }

    pub fn status(&self, ino: Ino) -> InodeStatus {
        self.inodes.get(ino as usize).copied().unwrap_or_default()
    }

    pub fn zero_links(&self) -> &HashSet<Ino> {
        &self.zero_links
    }

    pub fn dups(&self) -> &DupBlocks {
        &self.dups
    }

    pub fn blockmap(&self) -> &BlockMap {
        &self.blockmap
    }

    pub fn dirs(&self) -> &DirTree {
        &self.dirs
    }

    pub fn lost_found(&self) -> Ino {
        self.lost_found
    }

    pub fn device(&self) -> &D {
        self.cache.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.cache.device_mut()
    }

    pub fn into_parts(self) -> (FsckReport, D) {
        (self.report, self.cache.into_device())
    }

    /// Corrida completa: arranque, las cinco pasadas y el cierre.
    pub fn check(&mut self) -> Result<()> {
        if !self.setup()? {
            return Ok(());
        }
        self.pass1()?;
        if !self.dups.is_empty() {
            self.pass1b()?;
        }
        self.pass2()?;
        self.pass3()?;
        self.pass4()?;
        self.pass5()?;
        self.finish()
    }

    pub(crate) fn phase(&mut self, p: Phase) {
        self.phase = p;
        if let Some(banner) = p.banner() {
            info!("{banner}");
            if !self.opts.preen() {
                println!("** {banner}");
            }
        }
    }

    fn note(&mut self, tag: &'static str, line: String) {
        if self.phase.about_blocks() {
            self.report.blocks_ok = false;
        } else {
            self.report.inodes_ok = false;
        }
        self.report.tags.push(tag);
        self.report.errors.push(line);
    }

    /// Propone una reparación. Se cuenta como corregida o pendiente según
    /// la respuesta.
    pub(crate) fn ask(&mut self, q: Question) -> Result<bool> {
        warn!(tag = q.tag, detail = %q.detail, action = q.action, "inconsistencia");
        self.note(q.tag, q.line());
        let yes = self.operator.ask(&q)?;
        if yes {
            self.report.fixed += 1;
        } else {
            self.report.unresolved += 1;
        }
        Ok(yes)
    }

    /// Pregunta que no es una inconsistencia (continuar, marcar limpio...).
    pub(crate) fn confirm(&mut self, q: Question) -> Result<bool> {
        debug!(tag = q.tag, action = q.action, "confirmación");
        self.operator.ask(&q)
    }

    /// Inconsistencia que en preen no tiene arreglo automático.
    pub(crate) fn pfatal(&mut self, tag: &'static str, detail: impl Into<String>) -> Result<()> {
        let line = Question::new(tag, "").detail(detail).line();
        if self.opts.preen() {
            self.note(tag, line.clone());
            return Err(FsckError::Unexpected(line));
        }
        warn!(tag, "{line}");
        println!("{line}");
        self.note(tag, line);
        Ok(())
    }

    /// Aviso que no necesita respuesta.
    pub(crate) fn pwarn(&mut self, tag: &'static str, detail: impl Into<String>) {
        let line = Question::new(tag, "").detail(detail).line();
        warn!(tag, "{line}");
        println!("{line}");
        self.note(tag, line);
    }

    /// Reparación imposible: queda pendiente para el operador.
    pub(crate) fn unfixable(&mut self) {
        self.report.unresolved += 1;
    }

    fn standard_sb_offset(&self) -> u64 {
        match self.sb.version {
            UfsVersion::Ufs1 => SBLOCK_UFS1,
            UfsVersion::Ufs2 => SBLOCK_UFS2,
        }
    }

    fn sb_bytes(&self) -> Vec<u8> {
        let mut raw = self.sb.encode();
        let n = usize::try_from(self.sb.sbsize).unwrap_or(SBLOCKSIZE).min(raw.len());
        raw.truncate(n);
        raw
    }

    pub(crate) fn write_superblock(&mut self) -> Result<()> {
        let raw = self.sb_bytes();
        self.cache.write_raw(self.sb_offset, &raw)?;
        for (i, cs) in self.csums.iter().enumerate() {
            let at = i * CSUM_SIZE;
            if at + CSUM_SIZE > self.cs_raw.len() {
                break;
            }
            cs.encode(&mut self.cs_raw[at..at + CSUM_SIZE]);
        }
        let at = self.sb.byte_offset(self.sb.csaddr);
        let cs_raw = std::mem::take(&mut self.cs_raw);
        let res = self.cache.write_raw(at, &cs_raw);
        self.cs_raw = cs_raw;
        res?;
        self.sbdirty = false;
        debug!(offset = self.sb_offset, "superbloque escrito");
        Ok(())
    }

    /// Copias del superbloque en cada grupo (tras convertir el formato).
    fn write_alternates(&mut self) -> Result<()> {
        let raw = self.sb_bytes();
        for c in 0..i64::from(self.sb.ncg) {
            let at = self.sb.byte_offset(self.sb.cgsblock(c));
            self.cache.write_raw(at, &raw)?;
        }
        Ok(())
    }

    /// Cierre: vacía la caché, escribe el superbloque si cambió y lo marca
    /// limpio si no quedó nada pendiente.
    pub fn finish(&mut self) -> Result<()> {
        self.phase(Phase::Finish);
        let readonly = self.cache.is_readonly();
        let preen = self.opts.preen();

        if !readonly && (self.sbdirty || self.cache.is_dirty() || self.cache.written() > 0) {
            self.sb.time = now();
            self.sbdirty = true;
        }

        if self.used_alt && !readonly && !preen {
            let q = Question::new("UPDATE STANDARD SUPERBLOCK", "UPDATE");
            if self.confirm(q)? {
                self.sb_offset = self.standard_sb_offset();
                self.sbdirty = true;
            }
        }

        if !readonly && self.report.unresolved == 0 && self.sb.clean & FS_ISCLEAN == 0 {
            let mark = if preen {
                println!("MARKING FILE SYSTEM CLEAN");
                true
            } else {
                self.confirm(Question::new("MARK FILE SYSTEM CLEAN", "MARK"))?
            };
            if mark {
                self.sb.clean = FS_ISCLEAN;
                self.sbdirty = true;
                self.report.marked_clean = true;
            }
        }

        self.cache.flush()?;
        if self.sbdirty && !readonly {
            self.write_superblock()?;
            if self.converting {
                self.write_alternates()?;
            }
        }

        self.report.files = self.n_files;
        self.report.used_frags = self.n_blks;
        self.report.free_frags = self.sb.cstotal.nffree;
        self.report.free_blocks = self.sb.cstotal.nbfree;
        self.report.modified = self.cache.written() > 0;
        info!(
            files = self.n_files,
            used = self.n_blks,
            modified = self.report.modified,
            "revisión terminada"
        );
        Ok(())
    }
}

/// Revisa el sistema de archivos en `dev`. Ante un error fatal se escriben
/// los bloques que ya estaban corregidos y se devuelve el error.
pub fn run_fsck<D: Device>(
    dev: D,
    opts: FsckOptions,
    operator: Box<dyn Operator>,
) -> Result<(FsckReport, D)> {
    let mut fsck = Fsck::new(dev, opts, operator);
    match fsck.check() {
        Ok(()) => Ok(fsck.into_parts()),
        Err(e) => {
            if let Err(fe) = fsck.cache.flush() {
                warn!(error = %fe, "no se pudieron escribir los bloques pendientes");
            }
            Err(e)
        }
    }
}
