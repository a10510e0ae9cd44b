// Fase 5: grupos de cilindros. Cada grupo se reconstruye desde cero con los
// estados de inodo y el mapa de bloques de la fase 1, y se compara contra el
// del disco y contra la tabla de resúmenes del superbloque.

use tracing::{debug, info};

use crate::cg::{setbit, CylinderGroup};
use crate::fs::{CsumTotal, Ino, ROOTINO};

use super::dirscan::ScanFix;
use super::error::Result;
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

/// Respuestas que valen para toda la fase, una por tipo de problema.
struct Fixes {
    counts: ScanFix,
    maps: ScanFix,
    summary: ScanFix,
}

impl<D: Device> Fsck<D> {
    pub fn pass5(&mut self) -> Result<()> {
        self.phase(Phase::CylGroups);
        let mut fixes = Fixes {
            counts: ScanFix::DontKnow,
            maps: ScanFix::DontKnow,
            summary: ScanFix::DontKnow,
        };
        let mut total = CsumTotal::default();
        let mut rewritten = 0u32;
        for c in 0..i64::from(self.sb.ncg) {
            let (disk, magic_ok) = self.read_cg(c)?;
            if !magic_ok {
                self.pfatal("CG BAD MAGIC NUMBER", format!("CG {c}"))?;
            }
            let newcg = self.rebuild_cg(c, &disk);
            total.add(&newcg.cs);

            let idx = c as usize;
            if self.csums.get(idx).is_some_and(|cs| *cs != newcg.cs)
                && self.salvage(&mut fixes.counts, "FREE BLK COUNT(S) WRONG IN SUPERBLK", c)?
            {
                self.csums[idx] = newcg.cs;
                self.sbdirty = true;
            }

            if self.converting {
                self.store_cg(c, &newcg, CgPart::Whole)?;
                rewritten += 1;
                continue;
            }
            if (!newcg.header_eq(&disk) || !newcg.sums_eq(&disk))
                && self.salvage(&mut fixes.summary, "SUMMARY INFORMATION BAD", c)?
            {
                self.store_cg(c, &newcg, CgPart::Header)?;
                rewritten += 1;
            }
            if !newcg.maps_eq(&disk) && self.salvage(&mut fixes.maps, "BLK(S) MISSING IN BIT MAPS", c)? {
                self.store_cg(c, &newcg, CgPart::Maps)?;
                rewritten += 1;
            }
        }
        if self.converting {
            self.disk_cg_format = self.cg_format;
        }

        if total != self.sb.cstotal && self.salvage(&mut fixes.counts, "FREE BLK COUNT(S) WRONG IN SUPERBLK", -1)? {
            self.sb.cstotal = total;
            self.sbdirty = true;
        }
        info!(grupos = self.sb.ncg, reescritos = rewritten, "fase 5 terminada");
        Ok(())
    }

    /// El grupo `c` tal como debería estar.
    fn rebuild_cg(&self, c: i64, disk: &CylinderGroup) -> CylinderGroup {
        let sb = &self.sb;
        let mut cg = CylinderGroup::blank(sb, self.cg_format);
        let ipg = sb.ipg.max(0);
        let dbase = sb.cgbase(c);
        let dmax = (dbase + i64::from(sb.fpg)).min(sb.size);
        cg.time = disk.time;
        cg.cgx = c as i32;
        cg.ndblk = (dmax - dbase) as i32;
        if sb.is_ufs2() {
            cg.ffs2_niblk = ipg;
            cg.initediblk = if (0..=ipg).contains(&disk.initediblk) { disk.initediblk } else { ipg };
        } else {
            let rest = sb.ncyl % sb.cpg.max(1);
            let ncyl = if c == i64::from(sb.ncg) - 1 && rest > 0 { rest } else { sb.cpg };
            cg.ncyl = ncyl as i16;
            cg.niblk = ipg as i16;
        }
        if sb.contigsumsize > 0 {
            cg.nclusterblks = cg.ndblk / sb.frag.max(1);
        }
        cg.rotor = if (0..cg.ndblk).contains(&disk.rotor) { disk.rotor } else { 0 };
        cg.frotor = if (0..cg.ndblk).contains(&disk.frotor) { disk.frotor } else { 0 };
        cg.irotor = if (0..ipg).contains(&disk.irotor) { disk.irotor } else { 0 };

        cg.cs.nifree = ipg;
        let first = c * i64::from(ipg);
        for i in 0..ipg as usize {
            let ino = first + i as i64;
            if ino as u64 >= self.maxino {
                break;
            }
            let state = self.state(ino as Ino);
            if !state.is_allocated() {
                if c == 0 && (ino as Ino) < ROOTINO {
                    setbit(&mut cg.inosused, i);
                    cg.cs.nifree -= 1;
                }
                continue;
            }
            if matches!(state, InodeState::Dir | InodeState::DirFound | InodeState::DirClear) {
                cg.cs.ndir += 1;
            }
            setbit(&mut cg.inosused, i);
            cg.cs.nifree -= 1;
        }

        let size = sb.size;
        let blockmap = &self.blockmap;
        cg.account_blocks(sb, dbase, dmax, |d| d >= size || blockmap.test(d));
        cg
    }

    fn salvage(&mut self, fix: &mut ScanFix, tag: &'static str, c: i64) -> Result<bool> {
        match *fix {
            ScanFix::DontKnow => {
                let detail = if c < 0 { String::new() } else { format!("CG {c}") };
                let q = Question::new(tag, "SALVAGE").detail(detail).preen(PreenPolicy::Fix);
                let yes = self.ask(q)?;
                *fix = if yes { ScanFix::Fix } else { ScanFix::NoFix };
                Ok(yes)
            }
            ScanFix::Fix => {
                debug!(tag, cg = c, "corregido sin preguntar");
                Ok(true)
            }
            ScanFix::NoFix | ScanFix::Ignore => Ok(false),
        }
    }

    fn store_cg(&mut self, c: i64, cg: &CylinderGroup, part: CgPart) -> Result<()> {
        let blk = self.sb.cgtod(c);
        let bsize = self.sb.bsize as usize;
        let ufs2 = self.sb.is_ufs2();
        let format = self.cg_format;
        let b = self.cache.get(blk, bsize)?;
        match part {
            CgPart::Whole => {
                b.data.fill(0);
                cg.encode(&mut b.data, ufs2, format);
            }
            CgPart::Header => {
                cg.encode_header(&mut b.data, ufs2, format);
                cg.encode_sums(&mut b.data);
            }
            CgPart::Maps => cg.encode_maps(&mut b.data),
        }
        b.dirty = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum CgPart {
    Whole,
    Header,
    Maps,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cg::{cg_chkmagic, clrbit, isset, CgFormat};
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::{MemDevice, TestImage};
    use crate::fsck::prompt::ScriptedOperator;
    use crate::mkfs::MkfsParams;

    fn through_pass4(p: &MkfsParams, opts: FsckOptions) -> Fsck<MemDevice> {
        let t = TestImage::new(p).unwrap();
        let mut f = Fsck::new(t.device(), opts, Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f.pass2().unwrap();
        f.pass3().unwrap();
        f.pass4().unwrap();
        f
    }

    #[test]
    fn clean_groups_need_nothing() {
        for p in [MkfsParams::ufs2(), MkfsParams::ufs1_dynamic(), MkfsParams::ufs1_static()] {
            let mut f = through_pass4(&p, FsckOptions::default());
            f.pass5().unwrap();
            assert!(f.report.errors.is_empty(), "{:?}", f.report.errors);
            assert!(!f.cache.is_dirty());
            assert!(!f.sbdirty);
        }
    }

    #[test]
    fn free_fragment_marked_used_is_restored() {
        let mut f = through_pass4(&MkfsParams::ufs2(), FsckOptions::default());
        let d = f.sb.cgdmin(0) + 40;
        let at = (d - f.sb.cgbase(0)) as usize;
        let (mut cg, _) = f.read_cg(0).unwrap();
        clrbit(&mut cg.blksfree, at);
        f.write_cg(0, &cg).unwrap();

        f.pass5().unwrap();
        assert!(f.report.has_tag("BLK(S) MISSING IN BIT MAPS"));
        let (cg, _) = f.read_cg(0).unwrap();
        assert!(isset(&cg.blksfree, at));
    }

    #[test]
    fn wrong_summaries_are_rewritten() {
        let mut f = through_pass4(&MkfsParams::ufs2(), FsckOptions::default());
        let good = f.csums[1];
        let total = f.sb.cstotal;
        f.csums[1].nbfree += 3;
        f.sb.cstotal.nifree -= 1;

        f.pass5().unwrap();
        assert_eq!(f.report.count_tag("FREE BLK COUNT(S) WRONG IN SUPERBLK"), 1);
        assert_eq!(f.csums[1], good);
        assert_eq!(f.sb.cstotal, total);
        assert!(f.sbdirty);
    }

    #[test]
    fn declined_fix_leaves_group_alone() {
        let t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(false)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        let (mut cg, _) = f.read_cg(1).unwrap();
        cg.cs.nffree += 2;
        f.write_cg(1, &cg).unwrap();
        f.cache.flush().unwrap();
        let written = f.cache.written();

        f.pass5().unwrap();
        assert!(f.report.has_tag("SUMMARY INFORMATION BAD"));
        assert_eq!(f.report.unresolved, 1);
        assert!(!f.cache.is_dirty());
        assert_eq!(f.cache.written(), written);
    }

    #[test]
    fn conversion_rewrites_every_group() {
        let mut opts = FsckOptions::default();
        opts.convert = true;
        let mut f = through_pass4(&MkfsParams::ufs1_static(), opts);
        assert!(f.converting);
        f.pass5().unwrap();
        assert_eq!(f.disk_cg_format, CgFormat::Dynamic);
        for c in 0..i64::from(f.sb.ncg) {
            let (cg, ok) = f.read_cg(c).unwrap();
            assert!(ok);
            assert_eq!(cg.cgx, c as i32);
            assert_eq!(cg.layout, crate::cg::CgLayout::for_fs(&f.sb, CgFormat::Dynamic));
            let blk = f.sb.cgtod(c);
            let bsize = f.sb.bsize as usize;
            assert!(cg_chkmagic(&f.cache.get(blk, bsize).unwrap().data));
        }
    }
}
