/*Fase 1: cada inodo de cada grupo. Se clasifica (libre, archivo,
directorio), se validan tamaño y punteros, y cada fragmento alcanzable se
marca en el mapa reconstruido; los que ya estaban marcados son duplicados.*/

use tracing::{debug, info};

use crate::fs::{howmany, Ino, NDADDR, ROOTINO};
use crate::inode::{declared_blocks, ftypeok, garbage_beyond_size, iftodt, BlockRef, Dinode, Visit};

use super::error::{FsckError, Result};
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

/// Fragmentos inválidos tolerados por inodo.
const MAXBAD: u32 = 10;
/// Duplicados tolerados por inodo.
const MAXDUP: u32 = 10;
/// Tamaño máximo de un directorio.
const MAXDIRSIZE: u64 = 0x7fff_ffff;

#[derive(Debug, Default)]
struct BlockTally {
    bad: u32,
    dup: u32,
    frags: i64,
}

impl<D: Device> Fsck<D> {
    pub fn pass1(&mut self) -> Result<()> {
        self.phase(Phase::Blocks);
        self.mark_reserved();
        let ipg = i64::from(self.sb.ipg);
        for c in 0..i64::from(self.sb.ncg) {
            let mut inosused = ipg;
            if self.sb.is_ufs2() {
                let (cg, magic_ok) = self.read_cg(c)?;
                if magic_ok {
                    inosused = i64::from(cg.initediblk).clamp(0, ipg);
                }
            }
            debug!(cg = c, inosused, "revisando inodos del grupo");
            for i in 0..inosused {
                let ino = (c * ipg + i) as Ino;
                if ino < ROOTINO {
                    continue;
                }
                self.check_inode(ino)?;
            }
        }
        info!(files = self.n_files, frags = self.n_blks, dups = self.dups.len(), "fase 1 terminada");
        Ok(())
    }

    /// Copias del superbloque, cabeceras de grupo, tablas de inodos y la
    /// tabla de resúmenes no son de ningún inodo pero están ocupadas.
    fn mark_reserved(&mut self) {
        for c in 0..i64::from(self.sb.ncg) {
            let (start, end) = if c == 0 {
                (self.sb.cgbase(0), self.sb.cgdmin(0))
            } else {
                (self.sb.cgsblock(c), self.sb.cgdmin(c))
            };
            for d in start..end {
                self.blockmap.set(d);
            }
        }
        for d in self.sb.csaddr..self.sb.csaddr + self.sb.cs_frags() {
            self.blockmap.set(d);
        }
    }

    fn check_inode(&mut self, ino: Ino) -> Result<()> {
        let mut dp = self.ginode(ino)?;
        if dp.mode == 0 {
            if dp.is_partially_allocated() {
                let q = Question::new("PARTIALLY ALLOCATED INODE", "CLEAR").detail(format!("I={ino}"));
                if self.ask(q)? {
                    self.clear_inode(ino)?;
                }
            }
            self.set_state(ino, InodeState::Unallocated);
            return Ok(());
        }

        if let Some(why) = self.unacceptable(&dp) {
            debug!(ino, why, "inodo inválido");
            return self.unknown_type(ino, &dp);
        }

        self.n_files += 1;
        let st = &mut self.inodes[ino as usize];
        st.links = i32::from(dp.nlink);
        st.dtype = iftodt(dp.mode);
        if dp.nlink <= 0 {
            self.note_zero_link(ino)?;
        }
        if dp.is_dir() {
            let state = if dp.size == 0 {
                InodeState::DirClear
            } else {
                InodeState::Dir
            };
            self.set_state(ino, state);
            let bsize = i64::from(self.sb.bsize);
            self.dirs.insert(ino, &dp, bsize);
            if self.trim_dir_hole(ino, &mut dp)? {
                if dp.size == 0 {
                    self.set_state(ino, InodeState::DirClear);
                }
                self.dirs.insert(ino, &dp, bsize);
            }
        } else {
            self.set_state(ino, InodeState::File);
        }

        let mut tally = BlockTally::default();
        self.truncating = Some(ino);
        let walked = self.walk(&dp, |f, b| f.pass1_block(ino, b, &mut tally));
        self.truncating = None;
        walked?;

        let expect = tally.frags * self.sb.btodb(i64::from(self.sb.fsize));
        if dp.blocks != expect {
            let q = Question::new("INCORRECT BLOCK COUNT", "CORRECT")
                .detail(format!("I={ino} ({} should be {expect})", dp.blocks))
                .preen(PreenPolicy::Fix);
            if self.ask(q)? {
                let mut fresh = self.ginode(ino)?;
                fresh.blocks = expect;
                self.put_inode(ino, &fresh)?;
            }
        }
        Ok(())
    }

    /// Un directorio no puede tener bloques directos vacíos dentro de su
    /// tamaño. Si el operador acepta, se corta en el primero y se sueltan
    /// los punteros que quedan detrás.
    fn trim_dir_hole(&mut self, ino: Ino, dp: &mut Dinode) -> Result<bool> {
        let bsize = i64::from(self.sb.bsize);
        let ndb = howmany(dp.size as i64, bsize).clamp(0, NDADDR as i64) as usize;
        let Some(hole) = dp.db[..ndb].iter().position(|&b| b == 0) else {
            return Ok(false);
        };
        let path = self.pathname(ino)?;
        let q = Question::new("DIRECTORY CONTAINS EMPTY BLOCKS", "ADJUST LENGTH").detail(format!("I={ino} DIR={path}"));
        if !self.ask(q)? {
            return Ok(false);
        }
        dp.size = hole as u64 * bsize as u64;
        dp.db[hole..].fill(0);
        dp.ib.fill(0);
        self.put_inode(ino, dp)?;
        debug!(ino, size = dp.size, "directorio recortado en el hueco");
        Ok(true)
    }

    /// Motivo por el que el inodo no puede ser válido, si lo hay.
    fn unacceptable(&self, dp: &Dinode) -> Option<&'static str> {
        if dp.size > i64::MAX as u64 || dp.size > self.sb.maxfilesize {
            return Some("tamaño mayor que el máximo");
        }
        if dp.is_dir() && dp.size > MAXDIRSIZE {
            return Some("directorio demasiado grande");
        }
        let Some(ndb) = declared_blocks(dp, &self.geo) else {
            return Some("número de bloques no representable");
        };
        if let Some(kind) = garbage_beyond_size(dp, &self.geo, ndb) {
            return Some(if kind == "direct" {
                "puntero directo más allá del tamaño"
            } else {
                "puntero indirecto más allá del tamaño"
            });
        }
        if !ftypeok(dp.mode) {
            return Some("tipo de archivo desconocido");
        }
        None
    }

    fn unknown_type(&mut self, ino: Ino, dp: &Dinode) -> Result<()> {
        self.set_state(ino, InodeState::FileClear);
        let q = Question::new("UNKNOWN FILE TYPE", "CLEAR").detail(Self::inode_desc(ino, dp));
        if self.ask(q)? {
            self.set_state(ino, InodeState::Unallocated);
            self.clear_inode(ino)?;
        }
        Ok(())
    }

    fn note_zero_link(&mut self, ino: Ino) -> Result<()> {
        if self.zero_links.try_reserve(1).is_ok() {
            self.zero_links.insert(ino);
            return Ok(());
        }
        self.pfatal("LINK COUNT TABLE OVERFLOW", "")?;
        if !self.confirm(Question::new("CONTINUE", "CONTINUE"))? {
            return Err(FsckError::Aborted);
        }
        Ok(())
    }

    fn too_many(&mut self, tag: &'static str, ino: Ino) -> Result<()> {
        self.pwarn(tag, format!("I={ino}"));
        if !self.opts.preen() && !self.confirm(Question::new("CONTINUE", "CONTINUE"))? {
            return Err(FsckError::Aborted);
        }
        Ok(())
    }

    fn pass1_block(&mut self, ino: Ino, b: &BlockRef, tally: &mut BlockTally) -> Result<Visit> {
        let mut res = Visit::KEEPON;
        let out = self.chkrange(b.blkno, b.frags);
        if out {
            self.blkerror(ino, "BAD", b.blkno)?;
            tally.bad += 1;
            if tally.bad > MAXBAD {
                self.too_many("EXCESSIVE BAD BLKS", ino)?;
                return Ok(Visit::STOP);
            }
        }
        for d in b.blkno..b.blkno + b.frags {
            if out && self.chkrange(d, 1) {
                res = Visit::SKIP;
            } else if !self.blockmap.test(d) {
                self.blockmap.set(d);
                self.n_blks += 1;
            } else {
                self.blkerror(ino, "DUP", d)?;
                tally.dup += 1;
                if tally.dup > MAXDUP {
                    self.too_many("EXCESSIVE DUP BLKS", ino)?;
                    return Ok(Visit::STOP);
                }
                if let Err(e) = self.dups.claim(d) {
                    if !matches!(e, FsckError::NoMemory(_)) {
                        return Err(e);
                    }
                    self.pfatal("DUP TABLE OVERFLOW", "")?;
                    if !self.confirm(Question::new("CONTINUE", "CONTINUE"))? {
                        return Err(FsckError::Aborted);
                    }
                    return Ok(Visit::STOP);
                }
            }
            tally.frags += 1;
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::{MemDevice, TestImage};
    use crate::fsck::prompt::ScriptedOperator;
    use crate::fs::Daddr;
    use crate::mkfs::{MkfsParams, LOSTFOUNDINO};

    fn file_at(blk: Daddr, frags: i64) -> Dinode {
        let mut dp = Dinode {
            mode: crate::inode::IFREG | 0o644,
            nlink: 1,
            size: (frags * 1024) as u64,
            blocks: frags * 2,
            ..Dinode::default()
        };
        dp.db[0] = blk;
        dp
    }

    fn run(t: TestImage) -> Fsck<MemDevice> {
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f
    }

    #[test]
    fn directory_hole_cuts_the_length() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let frag = i64::from(t.sb.frag);
        let bsize = t.sb.bsize as u64;
        let first = (t.sb.cgdmin(1) + frag - 1) / frag * frag;
        let third = first + 2 * frag;
        let mut dp = Dinode {
            mode: crate::inode::IFDIR | 0o755,
            nlink: 2,
            size: 3 * bsize,
            blocks: frag * 2,
            ..Dinode::default()
        };
        dp.db[0] = first;
        dp.db[2] = third;
        t.put_inode(10, &dp);

        let mut f = run(t);
        assert_eq!(f.report.count_tag("DIRECTORY CONTAINS EMPTY BLOCKS"), 1);
        assert!(!f.report.has_tag("INCORRECT BLOCK COUNT"));
        let dp = f.ginode(10).unwrap();
        assert_eq!(dp.size, bsize);
        assert_eq!(dp.db[2], 0);
        assert_eq!(f.state(10), InodeState::Dir);
        assert_eq!(f.dirs.get(10).unwrap().isize, bsize);
        assert!(f.blockmap.test(first));
        assert!(!f.blockmap.test(third));
    }

    #[test]
    fn clean_image_classifies_root_and_lost_found() {
        let f = run(TestImage::new(&MkfsParams::ufs2()).unwrap());
        assert_eq!(f.state(ROOTINO), InodeState::Dir);
        assert_eq!(f.state(LOSTFOUNDINO), InodeState::Dir);
        assert_eq!(f.status(ROOTINO).links, 3);
        assert_eq!(f.n_files, 2);
        assert_eq!(f.n_blks, 2);
        assert!(f.zero_links.is_empty());
        assert!(f.dups.is_empty());
        assert_eq!(f.dirs.len(), 2);
        assert!(f.report.errors.is_empty());
    }

    #[test]
    fn zero_link_inode_is_listed_once() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut dp = file_at(0, 0);
        dp.nlink = 0;
        dp.blocks = 0;
        t.put_inode(7, &dp);
        let f = run(t);
        assert_eq!(f.zero_links.iter().copied().collect::<Vec<_>>(), vec![7]);
        assert_eq!(f.state(7), InodeState::File);
    }

    #[test]
    fn three_claims_make_one_duplicate() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let n = t.sb.cgdmin(0) + 40;
        for ino in 5..8 {
            t.put_inode(ino, &file_at(n, 1));
        }
        let f = run(t);
        assert_eq!(f.dups.distinct().collect::<Vec<_>>(), vec![n]);
        assert_eq!(f.dups.claims(n), 3);
        assert_eq!(f.state(5), InodeState::File);
        assert_eq!(f.state(6), InodeState::FileClear);
        assert_eq!(f.report.count_tag("DUP"), 2);
    }

    #[test]
    fn out_of_range_block_marks_inode_for_clearing() {
        let mut t = TestImage::new(&MkfsParams::ufs1_dynamic()).unwrap();
        let size = t.sb.size;
        t.put_inode(9, &file_at(size + 3, 1));
        let f = run(t);
        assert_eq!(f.state(9), InodeState::FileClear);
        assert!(f.report.has_tag("BAD"));
        assert!(!f.blockmap.test(size + 3));
    }

    #[test]
    fn wrong_block_count_is_corrected() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut dp = file_at(t.sb.cgdmin(0) + 16, 2);
        dp.blocks = 40;
        t.put_inode(5, &dp);
        let mut f = run(t);
        assert!(f.report.has_tag("INCORRECT BLOCK COUNT"));
        assert_eq!(f.ginode(5).unwrap().blocks, 4);
    }

    #[test]
    fn unknown_type_is_cleared() {
        let mut t = TestImage::new(&MkfsParams::ufs1_static()).unwrap();
        let mut dp = file_at(0, 0);
        dp.mode = crate::inode::IFWHT;
        dp.blocks = 0;
        t.put_inode(6, &dp);
        let mut f = run(t);
        assert!(f.report.has_tag("UNKNOWN FILE TYPE"));
        assert_eq!(f.state(6), InodeState::Unallocated);
        assert_eq!(f.ginode(6).unwrap(), Dinode::default());
    }

    #[test]
    fn garbage_pointer_past_size_is_unknown() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut dp = file_at(t.sb.cgdmin(0) + 16, 1);
        dp.db[5] = t.sb.cgdmin(0) + 24;
        t.put_inode(5, &dp);
        let f = run(t);
        assert!(f.report.has_tag("UNKNOWN FILE TYPE"));
    }
}
