/*Fase 1b. Cuando la fase 1 encuentra un duplicado, el primer dueño del
fragmento ya pasó sin aviso. Se vuelve a recorrer cada inodo en uso hasta
que cada duplicado tenga marcado también a su primer dueño.*/

use std::collections::HashSet;

use tracing::info;

use crate::fs::{Daddr, Ino, ROOTINO};
use crate::inode::Visit;

use super::error::Result;
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;

impl<D: Device> Fsck<D> {
    pub fn pass1b(&mut self) -> Result<()> {
        self.phase(Phase::Dups);
        let mut pending: HashSet<Daddr> = self.dups.distinct().collect();
        let mut ino = ROOTINO;
        while u64::from(ino) < self.maxino && !pending.is_empty() {
            if self.state(ino).is_allocated() {
                let dp = self.ginode(ino)?;
                self.walk(&dp, |f, b| {
                    let mut res = Visit::KEEPON;
                    for d in b.blkno..b.blkno + b.frags {
                        if f.chkrange(d, 1) {
                            res = Visit::SKIP;
                        } else if pending.remove(&d) {
                            f.blkerror(ino, "DUP", d)?;
                        }
                    }
                    if pending.is_empty() {
                        res = Visit::STOP;
                    }
                    Ok(res)
                })?;
            }
            ino += 1;
        }
        info!(sin_dueño = pending.len(), "fase 1b terminada");
        Ok(())
    }

    /// Inodos en uso que reclaman `d`, para diagnósticos.
    pub fn owners_of(&mut self, d: Daddr) -> Result<Vec<Ino>> {
        let mut owners = Vec::new();
        for ino in ROOTINO..self.maxino as Ino {
            if !self.state(ino).is_allocated() {
                continue;
            }
            let dp = self.ginode(ino)?;
            let mut hit = false;
            self.walk(&dp, |_, b| {
                if (b.blkno..b.blkno + b.frags).contains(&d) {
                    hit = true;
                    return Ok(Visit::STOP);
                }
                Ok(Visit::KEEPON)
            })?;
            if hit {
                owners.push(ino);
            }
        }
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use crate::fsck::config::FsckOptions;
    use crate::fsck::fsck::Fsck;
    use crate::fsck::fsck_types::InodeState;
    use crate::fsck::mock::TestImage;
    use crate::fsck::prompt::ScriptedOperator;
    use crate::inode::{Dinode, IFREG};
    use crate::mkfs::MkfsParams;

    #[test]
    fn first_owner_is_marked_too() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let n = t.sb.cgdmin(0) + 40;
        for ino in [5, 9] {
            let mut dp = Dinode {
                mode: IFREG | 0o600,
                nlink: 1,
                size: 1024,
                blocks: 2,
                ..Dinode::default()
            };
            dp.db[0] = n;
            t.put_inode(ino, &dp);
        }
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        assert_eq!(f.state(5), InodeState::File);
        assert_eq!(f.state(9), InodeState::FileClear);

        f.pass1b().unwrap();
        assert_eq!(f.state(5), InodeState::FileClear);
        assert_eq!(f.report.count_tag("DUP"), 2);
        assert_eq!(f.owners_of(n).unwrap(), vec![5, 9]);
    }
}
