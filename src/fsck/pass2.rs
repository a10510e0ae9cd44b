/*Fase 2: rutas. Revisa la raíz, recorre cada directorio en orden de bloque
y valida sus entradas: "." y ".." en su lugar, entradas que apuntan a
inodos libres o marcados, enlaces duros a directorios y tipos de entrada.
Cada entrada válida descuenta una referencia de su inodo. Al final se
corrige ".." con los padres encontrados y se marca lo alcanzable desde la
raíz.*/

use tracing::{debug, info};

use crate::dir::{dirsiz, DirRecord, DIRBLKSIZ, DT_DIR, DT_WHT};
use crate::fs::{howmany, Ino, ROOTINO, WINO};
use crate::inode::{Visit, IFDIR, IFMT};

use super::dirscan::ScanFix;
use super::dirtree::DOTDOT_UNFIXABLE;
use super::error::{FsckError, Result};
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

/// Lo que ocupa un directorio con sólo "." y "..".
const MINDIRSIZE: u64 = 24;

impl<D: Device> Fsck<D> {
    pub fn pass2(&mut self) -> Result<()> {
        self.phase(Phase::Pathnames);
        self.check_root()?;
        self.set_state(ROOTINO, InodeState::DirFound);

        self.dirs.sort_by_block();
        let inos = self.dirs.inos();
        for &ino in &inos {
            self.check_directory(ino)?;
        }
        for &ino in &inos {
            self.check_dotdot(ino)?;
        }
        self.propagate(ROOTINO);
        info!(directorios = inos.len(), "fase 2 terminada");
        Ok(())
    }

    fn reallocate_root(&mut self) -> Result<()> {
        match self.alloc_dir(ROOTINO, ROOTINO, 0o755)? {
            Some(ROOTINO) => Ok(()),
            _ => Err(FsckError::Fatal("CANNOT ALLOCATE ROOT INODE".into())),
        }
    }

    fn check_root(&mut self) -> Result<()> {
        match self.state(ROOTINO) {
            InodeState::Unallocated => {
                self.pfatal("ROOT INODE UNALLOCATED", "")?;
                if !self.ask(Question::new("ROOT INODE UNALLOCATED", "ALLOCATE"))? {
                    return Err(FsckError::Aborted);
                }
                self.reallocate_root()?;
            }
            InodeState::DirClear => {
                self.pfatal("DUPS/BAD IN ROOT INODE", "")?;
                if self.ask(Question::new("DUPS/BAD IN ROOT INODE", "REALLOCATE"))? {
                    self.free_inode(ROOTINO)?;
                    self.reallocate_root()?;
                } else if !self.confirm(Question::new("CONTINUE", "CONTINUE"))? {
                    return Err(FsckError::Aborted);
                }
            }
            InodeState::File | InodeState::FileClear => {
                self.pfatal("ROOT INODE NOT DIRECTORY", "")?;
                if self.ask(Question::new("ROOT INODE NOT DIRECTORY", "REALLOCATE"))? {
                    self.free_inode(ROOTINO)?;
                    self.reallocate_root()?;
                } else {
                    if !self.confirm(Question::new("ROOT INODE NOT DIRECTORY", "FIX"))? {
                        return Err(FsckError::Aborted);
                    }
                    let mut dp = self.ginode(ROOTINO)?;
                    dp.mode = (dp.mode & !IFMT) | IFDIR;
                    self.put_inode(ROOTINO, &dp)?;
                }
            }
            InodeState::Dir | InodeState::DirFound => {}
        }
        Ok(())
    }

    /// Tamaño mínimo y múltiplo de DIRBLKSIZ; después, las entradas.
    fn check_directory(&mut self, ino: Ino) -> Result<()> {
        let Some(isize) = self.dirs.get(ino).map(|n| n.isize) else {
            return Ok(());
        };
        if isize == 0 {
            return Ok(());
        }
        let mut fixed_size = None;
        if isize < MINDIRSIZE {
            let detail = self.dir_detail(ino)?;
            let q = Question::new("DIRECTORY TOO SHORT", "FIX").detail(detail);
            fixed_size = Some((DIRBLKSIZ as u64, self.ask(q)?));
        } else if isize % DIRBLKSIZ as u64 != 0 {
            let path = self.pathname(ino)?;
            let q = Question::new("DIRECTORY LENGTH NOT MULTIPLE OF 512", "ADJUST")
                .detail(format!("{path}: LENGTH {isize}"))
                .preen(PreenPolicy::Fix);
            let rounded = howmany(isize as i64, DIRBLKSIZ as i64) as u64 * DIRBLKSIZ as u64;
            fixed_size = Some((rounded, self.ask(q)?));
        }
        if let Some((size, write)) = fixed_size {
            if let Some(n) = self.dirs.get_mut(ino) {
                n.isize = size;
            }
            if write {
                let mut dp = self.ginode(ino)?;
                dp.size = size;
                self.put_inode(ino, &dp)?;
            }
        }

        let Some(dp) = self.dirs.get(ino).map(|n| n.as_dinode()) else {
            return Ok(());
        };
        let mut entryno = 0u32;
        self.scan_directory(ino, &dp, ScanFix::DontKnow, |f, rec| f.pass2_check(ino, &mut entryno, rec))?;
        Ok(())
    }

    fn ask_fix(&mut self, tag: &'static str, detail: String) -> Result<bool> {
        self.ask(Question::new(tag, "FIX").detail(detail))
    }

    /// Visitante de la fase 2. Los cambios se hacen sobre la copia del
    /// registro y sólo vuelven al disco si alguna pregunta se aceptó.
    fn pass2_check(&mut self, dir: Ino, entryno: &mut u32, rec: &mut DirRecord) -> Result<Visit> {
        let fmt = rec.format();
        let newfmt = fmt.has_type;
        let mut ret = Visit::default();
        let mut at = 0usize;
        let dotsz = dirsiz(1);
        let dotdotsz = dirsiz(2);

        if *entryno == 0 {
            let raw = rec.bytes();
            if fmt.ino(raw, 0) != 0 && fmt.name(raw, 0) == b"." {
                if fmt.ino(raw, 0) != dir {
                    let detail = self.dir_detail(dir)?;
                    fmt.set_ino(rec.bytes_mut(), 0, dir);
                    if self.ask_fix("BAD INODE NUMBER FOR '.'", detail)? {
                        ret |= Visit::ALTERED;
                    }
                }
                if newfmt && fmt.dtype(rec.bytes(), 0) != DT_DIR {
                    let detail = self.dir_detail(dir)?;
                    fmt.set_type(rec.bytes_mut(), 0, DT_DIR);
                    if self.ask_fix("BAD TYPE VALUE FOR '.'", detail)? {
                        ret |= Visit::ALTERED;
                    }
                }
            } else {
                let first_ino = fmt.ino(raw, 0);
                let first_name = String::from_utf8_lossy(fmt.name(raw, 0)).into_owned();
                let reclen = rec.reclen();
                let detail = self.dir_detail(dir)?;
                if first_ino != 0 && first_name != ".." {
                    self.pfatal(
                        "MISSING '.'",
                        format!("{detail} CANNOT FIX, FIRST ENTRY IN DIRECTORY CONTAINS {first_name}"),
                    )?;
                    self.unfixable();
                } else if reclen < dotsz {
                    self.pfatal("MISSING '.'", format!("{detail} CANNOT FIX, INSUFFICIENT SPACE TO ADD '.'"))?;
                    self.unfixable();
                } else if reclen < 2 * dotsz {
                    fmt.write_entry(rec.bytes_mut(), 0, dir, reclen, DT_DIR, b".");
                    if self.ask_fix("MISSING '.'", detail)? {
                        ret |= Visit::ALTERED;
                    }
                } else {
                    let raw = rec.bytes_mut();
                    fmt.write_entry(raw, 0, dir, dotsz, DT_DIR, b".");
                    raw[dotsz..reclen].fill(0);
                    fmt.set_reclen(raw, dotsz, reclen - dotsz);
                    *entryno += 1;
                    self.add_links(dir, -1);
                    at = dotsz;
                    if self.ask_fix("MISSING '.'", detail)? {
                        ret |= Visit::ALTERED;
                    }
                }
            }
        }

        if *entryno <= 1 {
            let parent = self.dirs.get(dir).map_or(0, |n| n.parent);
            let mut to_dotdot = true;
            if *entryno == 0 {
                let raw = rec.bytes();
                let n = dirsiz(fmt.namlen(raw, at));
                let reclen = fmt.reclen(raw, at);
                if reclen < n + dotdotsz {
                    to_dotdot = false;
                } else {
                    let self_ino = fmt.ino(raw, at);
                    let raw = rec.bytes_mut();
                    fmt.set_reclen(raw, at, n);
                    *entryno += 1;
                    self.add_links(self_ino, -1);
                    at += n;
                    raw[at..at + reclen - n].fill(0);
                    fmt.set_reclen(raw, at, reclen - n);
                }
            }
            if to_dotdot {
                let raw = rec.bytes();
                let ino = fmt.ino(raw, at);
                let name = fmt.name(raw, at).to_vec();
                if ino != 0 && name == b".." {
                    if let Some(n) = self.dirs.get_mut(dir) {
                        n.dotdot = ino;
                    }
                    if newfmt && fmt.dtype(raw, at) != DT_DIR {
                        let detail = self.dir_detail(dir)?;
                        fmt.set_type(rec.bytes_mut(), at, DT_DIR);
                        if self.ask_fix("BAD TYPE VALUE FOR '..'", detail)? {
                            ret |= Visit::ALTERED;
                        }
                    }
                } else {
                    let reclen = fmt.reclen(raw, at);
                    if ino != 0 && name != b"." {
                        let detail = self.entry_detail(parent, dir)?;
                        let name = String::from_utf8_lossy(&name);
                        self.pfatal(
                            "MISSING '..'",
                            format!("{detail} CANNOT FIX, SECOND ENTRY IN DIRECTORY CONTAINS {name}"),
                        )?;
                        self.unfixable();
                        self.set_dotdot(dir, DOTDOT_UNFIXABLE);
                    } else if reclen < dotdotsz {
                        let detail = self.entry_detail(parent, dir)?;
                        self.pfatal("MISSING '..'", format!("{detail} CANNOT FIX, INSUFFICIENT SPACE TO ADD '..'"))?;
                        self.unfixable();
                        self.set_dotdot(dir, DOTDOT_UNFIXABLE);
                    } else if parent != 0 {
                        self.set_dotdot(dir, parent);
                        let detail = self.entry_detail(parent, dir)?;
                        fmt.write_entry(rec.bytes_mut(), at, parent, reclen, DT_DIR, b"..");
                        if self.ask_fix("MISSING '..'", detail)? {
                            ret |= Visit::ALTERED;
                        }
                    }
                    *entryno += 1;
                    let ino = fmt.ino(rec.bytes(), at);
                    if ino != 0 {
                        self.add_links(ino, -1);
                    }
                    return Ok(ret | Visit::KEEPON);
                }
            }
        }

        self.check_entry(dir, entryno, rec, at, ret)
    }

    /// Una entrada cualquiera (incluidos "." y ".." ya validados).
    fn check_entry(&mut self, dir: Ino, entryno: &mut u32, rec: &mut DirRecord, at: usize, mut ret: Visit) -> Result<Visit> {
        let fmt = rec.format();
        let raw = rec.bytes();
        let ino = fmt.ino(raw, at);
        if ino == 0 {
            return Ok(ret | Visit::KEEPON);
        }
        let name = fmt.name(raw, at);
        if *entryno >= 2 && (name == b"." || name == b"..") {
            let tag = if name == b"." { "EXTRA '.' ENTRY" } else { "EXTRA '..' ENTRY" };
            let detail = self.dir_detail(dir)?;
            fmt.set_ino(rec.bytes_mut(), at, 0);
            if self.ask_fix(tag, detail)? {
                ret |= Visit::ALTERED;
            }
            return Ok(ret | Visit::KEEPON);
        }
        *entryno += 1;
        let dtype = fmt.dtype(raw, at);

        let mut remove = false;
        if u64::from(ino) >= self.maxino {
            let detail = self.entry_detail(dir, ino)?;
            remove = self.ask(Question::new("I OUT OF RANGE", "REMOVE").detail(detail))?;
        } else if fmt.has_type && ((ino == WINO) != (dtype == DT_WHT)) {
            let detail = self.entry_detail(dir, ino)?;
            let raw = rec.bytes_mut();
            fmt.set_ino(raw, at, WINO);
            fmt.set_type(raw, at, DT_WHT);
            if self.ask_fix("BAD WHITEOUT ENTRY", detail)? {
                ret |= Visit::ALTERED;
            }
        } else {
            loop {
                match self.state(ino) {
                    InodeState::Unallocated => {
                        if *entryno > 2 {
                            let detail = self.entry_detail(dir, ino)?;
                            remove = self.ask(Question::new("UNALLOCATED", "REMOVE").detail(detail))?;
                        }
                    }
                    st @ (InodeState::DirClear | InodeState::FileClear) => {
                        if *entryno <= 2 {
                            break;
                        }
                        let tag = if st == InodeState::FileClear {
                            "DUP/BAD"
                        } else if !self.opts.preen() {
                            "ZERO LENGTH DIRECTORY"
                        } else {
                            remove = true;
                            break;
                        };
                        let detail = self.entry_detail(dir, ino)?;
                        remove = self.ask(Question::new(tag, "REMOVE").detail(detail))?;
                        if remove {
                            break;
                        }
                        let dp = self.ginode(ino)?;
                        let back = if dp.mode & IFMT == IFDIR { InodeState::Dir } else { InodeState::File };
                        self.set_state(ino, back);
                        self.inodes[ino as usize].links = i32::from(dp.nlink);
                        continue;
                    }
                    InodeState::Dir | InodeState::DirFound => {
                        let parent = self.dirs.get(ino).map_or(0, |n| n.parent);
                        if parent != 0 && *entryno > 2 {
                            let from = self.pathname(dir)?;
                            let to = self.pathname(ino)?;
                            let q = Question::new("EXTRANEOUS HARD LINK TO DIRECTORY", "REMOVE")
                                .detail(format!("{from} -> {to}"))
                                .preen(PreenPolicy::Skip);
                            remove = self.ask(q)?;
                            if remove {
                                break;
                            }
                        }
                        if parent == 0 && *entryno > 2 {
                            self.dirs.link(dir, ino);
                            debug!(dir, child = ino, "padre encontrado");
                        }
                        ret |= self.check_type(dir, rec, at, ino)?;
                        self.add_links(ino, -1);
                    }
                    InodeState::File => {
                        ret |= self.check_type(dir, rec, at, ino)?;
                        self.add_links(ino, -1);
                    }
                }
                break;
            }
        }
        if !remove {
            return Ok(ret | Visit::KEEPON);
        }
        fmt.set_ino(rec.bytes_mut(), at, 0);
        Ok(ret | Visit::KEEPON | Visit::ALTERED)
    }

    fn check_type(&mut self, dir: Ino, rec: &mut DirRecord, at: usize, ino: Ino) -> Result<Visit> {
        let fmt = rec.format();
        let want = self.status(ino).dtype;
        if !fmt.has_type || fmt.dtype(rec.bytes(), at) == want {
            return Ok(Visit::default());
        }
        let detail = self.entry_detail(dir, ino)?;
        fmt.set_type(rec.bytes_mut(), at, want);
        Ok(if self.ask_fix("BAD TYPE VALUE", detail)? { Visit::ALTERED } else { Visit::default() })
    }

    fn set_dotdot(&mut self, dir: Ino, dotdot: Ino) {
        if let Some(n) = self.dirs.get_mut(dir) {
            n.dotdot = dotdot;
        }
    }

    /// Con todos los padres conocidos, ".." debe apuntar al padre.
    fn check_dotdot(&mut self, ino: Ino) -> Result<()> {
        let Some((parent, dotdot, isize)) = self.dirs.get(ino).map(|n| (n.parent, n.dotdot, n.isize)) else {
            return Ok(());
        };
        if parent == 0 || isize == 0 || dotdot == parent || dotdot == DOTDOT_UNFIXABLE {
            return Ok(());
        }
        if dotdot == 0 {
            self.set_dotdot(ino, parent);
            let detail = self.entry_detail(parent, ino)?;
            if self.ask_fix("MISSING '..'", detail)? {
                self.insert_entry(ino, parent, b"..")?;
                self.add_links(parent, -1);
            }
            return Ok(());
        }
        let detail = self.entry_detail(parent, ino)?;
        if !self.ask_fix("BAD INODE NUMBER FOR '..'", detail)? {
            return Ok(());
        }
        self.add_links(dotdot, 1);
        self.add_links(parent, -1);
        self.set_dotdot(ino, parent);
        self.change_entry_owner(ino, b"..", parent)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::{MemDevice, TestImage};
    use crate::fsck::prompt::ScriptedOperator;
    use crate::mkfs::{MkfsParams, LOSTFOUNDINO};

    fn through_pass2(t: TestImage) -> Fsck<MemDevice> {
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f.pass2().unwrap();
        f
    }

    fn entry_at(t: &TestImage, dir: Ino) -> usize {
        let blk = t.inode(dir).db[0];
        t.sb.byte_offset(blk) as usize
    }

    #[test]
    fn clean_tree_balances_every_count() {
        let f = through_pass2(TestImage::new(&MkfsParams::ufs2()).unwrap());
        assert!(f.report.errors.is_empty());
        assert_eq!(f.state(ROOTINO), InodeState::DirFound);
        assert_eq!(f.state(LOSTFOUNDINO), InodeState::DirFound);
        assert_eq!(f.status(ROOTINO).links, 0);
        assert_eq!(f.status(LOSTFOUNDINO).links, 0);
        assert_eq!(f.dirs.get(LOSTFOUNDINO).map(|n| (n.parent, n.dotdot)), Some((ROOTINO, ROOTINO)));
    }

    #[test]
    fn old_format_tree_is_clean_too() {
        let f = through_pass2(TestImage::new(&MkfsParams::ufs1_static()).unwrap());
        assert!(f.report.errors.is_empty());
        assert_eq!(f.status(LOSTFOUNDINO).links, 0);
    }

    #[test]
    fn entry_to_unallocated_inode_is_removed() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let at = entry_at(&t, ROOTINO);
        // "lost+found" -> inodo 40, que nadie usa.
        t.img[at + 24..at + 28].copy_from_slice(&40u32.to_le_bytes());
        let mut f = through_pass2(t);
        assert!(f.report.has_tag("UNALLOCATED"));
        assert_eq!(f.find_entry(ROOTINO, b"lost+found").unwrap(), None);
        assert_ne!(f.state(LOSTFOUNDINO), InodeState::DirFound);
    }

    #[test]
    fn wrong_dot_is_fixed() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let at = entry_at(&t, LOSTFOUNDINO);
        t.img[at..at + 4].copy_from_slice(&9u32.to_le_bytes());
        let mut f = through_pass2(t);
        assert!(f.report.has_tag("BAD INODE NUMBER FOR '.'"));
        assert_eq!(f.find_entry(LOSTFOUNDINO, b".").unwrap(), Some(LOSTFOUNDINO));
        assert_eq!(f.status(LOSTFOUNDINO).links, 0);
    }

    #[test]
    fn wrong_dotdot_is_pointed_at_parent() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let at = entry_at(&t, LOSTFOUNDINO);
        t.img[at + 12..at + 16].copy_from_slice(&LOSTFOUNDINO.to_le_bytes());
        let mut f = through_pass2(t);
        assert!(f.report.has_tag("BAD INODE NUMBER FOR '..'"));
        assert_eq!(f.find_entry(LOSTFOUNDINO, b"..").unwrap(), Some(ROOTINO));
        assert_eq!(f.status(ROOTINO).links, 0);
        assert_eq!(f.status(LOSTFOUNDINO).links, 0);
    }

    #[test]
    fn wrong_entry_type_is_fixed() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let at = entry_at(&t, ROOTINO);
        t.img[at + 24 + 6] = crate::dir::DT_REG;
        let mut f = through_pass2(t);
        assert!(f.report.has_tag("BAD TYPE VALUE"));
        let dp = f.ginode(ROOTINO).unwrap();
        let data = f.cache.get(dp.db[0], 1024).unwrap().data.clone();
        assert_eq!(data[24 + 6], DT_DIR);
    }

    #[test]
    fn unallocated_root_is_recreated() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        t.put_inode(ROOTINO, &crate::inode::Dinode::default());
        let f = through_pass2(t);
        assert!(f.report.has_tag("ROOT INODE UNALLOCATED"));
        assert_eq!(f.state(ROOTINO), InodeState::DirFound);
        assert_eq!(f.state(LOSTFOUNDINO), InodeState::Dir);
    }

    #[test]
    fn ragged_directory_size_is_rounded() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut dp = t.inode(LOSTFOUNDINO);
        dp.size = 700;
        t.put_inode(LOSTFOUNDINO, &dp);
        let mut f = through_pass2(t);
        assert!(f.report.has_tag("DIRECTORY LENGTH NOT MULTIPLE OF 512"));
        assert_eq!(f.ginode(LOSTFOUNDINO).unwrap().size, 1024);
    }
}
