/*Fase 4: contadores de referencias. Lo que quedó en `links` tras la fase 2
es la diferencia entre nlink y las entradas encontradas. Si no hay ninguna
entrada se intenta reconectar; si la diferencia es parcial se ajusta
nlink. Los inodos sin referencias y los marcados para borrar se borran.*/

use tracing::info;

use crate::fs::{Ino, ROOTINO};
use crate::inode::{IFDIR, IFMT};

use super::error::Result;
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

#[derive(Debug, Clone, Copy)]
enum ClearReason {
    Unref,
    ZeroLength,
    BadDup,
}

impl<D: Device> Fsck<D> {
    pub fn pass4(&mut self) -> Result<()> {
        self.phase(Phase::RefCounts);
        let mut cleared = 0u32;
        for ino in ROOTINO..self.maxino as Ino {
            match self.state(ino) {
                InodeState::File | InodeState::DirFound => {
                    let links = self.status(ino).links;
                    if links != 0 {
                        self.adjust_links(ino, links)?;
                    } else if self.zero_links.remove(&ino) {
                        cleared += u32::from(self.clear_unref(ino, ClearReason::Unref)?);
                    }
                }
                InodeState::Dir => {
                    cleared += u32::from(self.clear_unref(ino, ClearReason::Unref)?);
                }
                InodeState::DirClear => {
                    let reason = if self.ginode(ino)?.size == 0 {
                        ClearReason::ZeroLength
                    } else {
                        ClearReason::BadDup
                    };
                    cleared += u32::from(self.clear_unref(ino, reason)?);
                }
                InodeState::FileClear => {
                    cleared += u32::from(self.clear_unref(ino, ClearReason::BadDup)?);
                }
                InodeState::Unallocated => {}
            }
        }
        info!(borrados = cleared, "fase 4 terminada");
        Ok(())
    }

    /// nlink de `ino` sobra en `lcnt`. Si no tiene ninguna entrada se
    /// reconecta (o se borra); si no, se corrige nlink.
    pub(crate) fn adjust_links(&mut self, ino: Ino, lcnt: i32) -> Result<()> {
        let mut dp = self.ginode(ino)?;
        let nlink = i32::from(dp.nlink);
        if nlink == lcnt {
            if !self.reconnect_orphan(ino, None)? {
                self.clear_unref(ino, ClearReason::Unref)?;
            }
            return Ok(());
        }
        let tag = if ino == self.lost_found {
            "LINK COUNT lost+found"
        } else if dp.mode & IFMT == IFDIR {
            "LINK COUNT DIR"
        } else {
            "LINK COUNT FILE"
        };
        let detail = format!("{} COUNT {nlink} SHOULD BE {}", Self::inode_desc(ino, &dp), nlink - lcnt);
        if self.opts.preen() && lcnt < 0 {
            self.pfatal("LINK COUNT INCREASING", detail.clone())?;
        }
        if self.ask(Question::new(tag, "ADJUST").detail(detail).preen(PreenPolicy::Fix))? {
            dp.nlink = (nlink - lcnt) as i16;
            self.put_inode(ino, &dp)?;
            if let Some(st) = self.inodes.get_mut(ino as usize) {
                st.links = 0;
            }
        }
        Ok(())
    }

    /// Borra el inodo y suelta sus bloques (salvo los que otro reclama).
    fn clear_unref(&mut self, ino: Ino, reason: ClearReason) -> Result<bool> {
        let dp = self.ginode(ino)?;
        let dir = dp.mode & IFMT == IFDIR;
        let tag = match (reason, dir) {
            (ClearReason::Unref, true) => "UNREF DIR",
            (ClearReason::Unref, false) => "UNREF FILE",
            (ClearReason::ZeroLength, true) => "ZERO LENGTH DIR",
            (ClearReason::ZeroLength, false) => "ZERO LENGTH FILE",
            (ClearReason::BadDup, true) => "BAD/DUP DIR",
            (ClearReason::BadDup, false) => "BAD/DUP FILE",
        };
        let q = Question::new(tag, "CLEAR")
            .detail(Self::inode_desc(ino, &dp))
            .preen(PreenPolicy::Fix);
        if !self.ask(q)? {
            return Ok(false);
        }
        self.free_inode(ino)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Daddr, NDADDR};
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::{MemDevice, TestImage};
    use crate::fsck::prompt::ScriptedOperator;
    use crate::inode::{Dinode, IFREG};
    use crate::mkfs::{MkfsParams, LOSTFOUNDINO};

    fn file(blk: Daddr, nlink: i16) -> Dinode {
        let mut db = [0; NDADDR];
        db[0] = blk;
        Dinode {
            mode: IFREG | 0o644,
            nlink,
            size: 100,
            blocks: 2,
            db,
            ..Dinode::default()
        }
    }

    fn start(t: TestImage) -> Fsck<MemDevice> {
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f
    }

    fn finish_to_pass4(f: &mut Fsck<MemDevice>) {
        f.pass2().unwrap();
        f.pass3().unwrap();
        f.pass4().unwrap();
    }

    #[test]
    fn zero_link_file_is_cleared() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let blk = t.sb.cgdmin(0) + 24;
        t.put_inode(7, &file(blk, 0));
        let mut f = start(t);
        finish_to_pass4(&mut f);
        assert!(f.report.has_tag("UNREF FILE"));
        assert_eq!(f.state(7), InodeState::Unallocated);
        assert!(!f.blockmap.test(blk));
        assert!(f.zero_links.is_empty());
    }

    #[test]
    fn orphan_with_links_is_reconnected() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        t.put_inode(7, &file(t.sb.cgdmin(0) + 24, 1));
        let mut f = start(t);
        finish_to_pass4(&mut f);
        assert_eq!(f.state(7), InodeState::File);
        assert_eq!(f.find_entry(LOSTFOUNDINO, b"#007").unwrap(), Some(7));
        assert_eq!(f.ginode(7).unwrap().nlink, 1);
    }

    #[test]
    fn excess_link_count_is_lowered() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        t.put_inode(7, &file(t.sb.cgdmin(0) + 24, 3));
        let mut f = start(t);
        assert!(f.insert_entry(ROOTINO, 7, b"archivo").unwrap());
        finish_to_pass4(&mut f);
        assert!(f.report.has_tag("LINK COUNT FILE"));
        assert_eq!(f.ginode(7).unwrap().nlink, 1);
    }

    #[test]
    fn empty_directory_is_cleared_as_zero_length() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let dp = Dinode {
            mode: IFDIR | 0o755,
            nlink: 2,
            ..Dinode::default()
        };
        t.put_inode(8, &dp);
        let mut f = start(t);
        assert_eq!(f.state(8), InodeState::DirClear);
        finish_to_pass4(&mut f);
        assert!(f.report.has_tag("ZERO LENGTH DIR"));
        assert_eq!(f.state(8), InodeState::Unallocated);
    }

    #[test]
    fn preen_refuses_to_raise_a_link_count() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        t.put_inode(7, &file(t.sb.cgdmin(0) + 24, 1));
        let mut opts = FsckOptions::default();
        opts.mode = crate::fsck::config::AnswerMode::Preen;
        opts.force = true;
        let mut f = Fsck::new(t.device(), opts, Box::new(crate::fsck::prompt::PreenOperator));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        assert!(f.insert_entry(ROOTINO, 7, b"a").unwrap());
        assert!(f.insert_entry(ROOTINO, 7, b"b").unwrap());
        f.pass2().unwrap();
        f.pass3().unwrap();
        assert!(matches!(f.pass4(), Err(crate::fsck::error::FsckError::Unexpected(_))));
    }
}
