/*Acceso a inodos y asignación de espacio. Todo pasa por la caché: leer y
escribir inodos, validar rangos de fragmentos, leer y reescribir grupos de
cilindros, reservar y liberar bloques e inodos.*/

use tracing::{debug, trace};

use crate::cg::{cg_chkmagic, clrbit, setbit, CylinderGroup};
use crate::fs::{Daddr, Ino, ROOTINO};
use crate::inode::{iftodt, walk_blocks, BlockRef, Dinode, IndirectSource, Visit, IFDIR, IFLNK, IFMT, IFREG};

use super::error::{FsckError, Result};
use super::fsck::{now, Fsck};
use super::fsck_backend::Device;
use super::fsck_types::{InodeState, InodeStatus};
use super::prompt::{PreenPolicy, Question};

impl<D: Device> IndirectSource for Fsck<D> {
    type Error = FsckError;

    fn indirect_block(&mut self, blk: Daddr) -> Result<Option<Vec<u8>>> {
        if self.chkrange(blk, i64::from(self.sb.frag)) {
            return Ok(None);
        }
        let bsize = self.sb.bsize as usize;
        Ok(Some(self.cache.get(blk, bsize)?.data.clone()))
    }

    /// Sólo en la fase 1: se ofrece poner a cero lo que sobra.
    fn stray_pointers(&mut self, blk: Daddr, from: usize) -> Result<()> {
        let Some(ino) = self.truncating else {
            return Ok(());
        };
        let q = Question::new("PARTIALLY TRUNCATED INODE", "SALVAGE")
            .detail(format!("I={ino}"))
            .preen(PreenPolicy::Fix);
        if !self.ask(q)? {
            return Ok(());
        }
        let bsize = self.sb.bsize as usize;
        let ptr = self.geo.ptr_size();
        let b = self.cache.get(blk, bsize)?;
        if let Some(tail) = b.data.get_mut(from * ptr..) {
            tail.fill(0);
        }
        b.dirty = true;
        debug!(ino, blk, from, "punteros más allá del tamaño puestos a cero");
        Ok(())
    }
}

impl<D: Device> Fsck<D> {
    fn inode_slot(&self, ino: Ino) -> Result<(Daddr, usize, usize)> {
        if u64::from(ino) >= self.maxino {
            return Err(FsckError::Fatal(format!("número de inodo fuera de rango: {ino}")));
        }
        let isize = self.sb.inode_size();
        Ok((self.sb.ino_to_fsba(ino), self.sb.ino_to_fsbo(ino) * isize, isize))
    }

    /// Lee el inodo `ino` del disco (a través de la caché).
    pub fn ginode(&mut self, ino: Ino) -> Result<Dinode> {
        let (blk, at, isize) = self.inode_slot(ino)?;
        let version = self.sb.version;
        let bsize = self.sb.bsize as usize;
        let b = self.cache.get(blk, bsize)?;
        Ok(Dinode::decode(version, &b.data[at..at + isize]))
    }

    pub fn put_inode(&mut self, ino: Ino, dp: &Dinode) -> Result<()> {
        let (blk, at, isize) = self.inode_slot(ino)?;
        let version = self.sb.version;
        let bsize = self.sb.bsize as usize;
        let b = self.cache.get(blk, bsize)?;
        dp.encode(version, &mut b.data[at..at + isize]);
        b.dirty = true;
        trace!(ino, "inodo modificado");
        Ok(())
    }

    pub fn clear_inode(&mut self, ino: Ino) -> Result<()> {
        self.put_inode(ino, &Dinode::default())
    }

    pub(crate) fn state(&self, ino: Ino) -> InodeState {
        self.status(ino).state
    }

    pub(crate) fn set_state(&mut self, ino: Ino, state: InodeState) {
        if let Some(st) = self.inodes.get_mut(ino as usize) {
            st.state = state;
        }
    }

    pub(crate) fn add_links(&mut self, ino: Ino, delta: i32) {
        if let Some(st) = self.inodes.get_mut(ino as usize) {
            st.links += delta;
        }
    }

    /// true si `cnt` fragmentos desde `blk` no forman un rango válido: fuera
    /// del sistema, cruzando un bloque o pisando los metadatos de un grupo.
    pub(crate) fn chkrange(&self, blk: Daddr, cnt: i64) -> bool {
        let sb = &self.sb;
        if cnt <= 0 || blk <= 0 || blk > sb.size || cnt > sb.size - blk {
            return true;
        }
        let frag = i64::from(sb.frag);
        if cnt > frag || sb.fragnum(blk) + cnt > frag {
            debug!(blk, cnt, "rango de fragmentos mal alineado");
            return true;
        }
        let c = sb.dtog(blk);
        if blk < sb.cgdmin(c) {
            if blk + cnt > sb.cgsblock(c) {
                debug!(blk, cg = c, "el rango pisa los metadatos del grupo");
                return true;
            }
        } else if blk + cnt > sb.cgbase(c + 1) {
            debug!(blk, cg = c, "el rango se sale del grupo");
            return true;
        }
        false
    }

    /// Recorre los bloques de `dp` con la sesión como contexto.
    pub(crate) fn walk<F>(&mut self, dp: &Dinode, visit: F) -> Result<Visit>
    where
        F: FnMut(&mut Self, &BlockRef) -> Result<Visit>,
    {
        let geo = self.geo;
        walk_blocks(self, geo, dp, visit)
    }

    /// Grupo `c` tal como está en disco, y si su magic es válido.
    pub(crate) fn read_cg(&mut self, c: i64) -> Result<(CylinderGroup, bool)> {
        let blk = self.sb.cgtod(c);
        let bsize = self.sb.bsize as usize;
        let format = self.disk_cg_format;
        let data = &self.cache.get(blk, bsize)?.data;
        Ok((CylinderGroup::decode(data, &self.sb, format), cg_chkmagic(data)))
    }

    pub(crate) fn write_cg(&mut self, c: i64, cg: &CylinderGroup) -> Result<()> {
        let blk = self.sb.cgtod(c);
        let bsize = self.sb.bsize as usize;
        let format = self.disk_cg_format;
        let ufs2 = self.sb.is_ufs2();
        let b = self.cache.get(blk, bsize)?;
        cg.encode(&mut b.data, ufs2, format);
        b.dirty = true;
        Ok(())
    }

    fn cg_for_update(&mut self, c: i64) -> Result<CylinderGroup> {
        let (cg, magic_ok) = self.read_cg(c)?;
        if !magic_ok {
            self.pfatal("CG BAD MAGIC NUMBER", format!("CG {c}"))?;
        }
        Ok(cg)
    }

    /// Primer hueco de `frags` fragmentos contiguos dentro de un bloque. Marca
    /// el mapa reconstruido y el del grupo en disco.
    pub fn alloc_block(&mut self, frags: i64) -> Result<Option<Daddr>> {
        let frag = i64::from(self.sb.frag);
        if frags <= 0 || frags > frag {
            return Ok(None);
        }
        let mut i = 0;
        while i < self.sb.size - frag {
            let mut j = 0;
            while j <= frag - frags {
                if self.blockmap.test(i + j) {
                    j += 1;
                    continue;
                }
                let mut k = 1;
                while k < frags && !self.blockmap.test(i + j + k) {
                    k += 1;
                }
                if k < frags {
                    j += k + 1;
                    continue;
                }

                let first = i + j;
                let c = self.sb.dtog(first);
                let mut cg = self.cg_for_update(c)?;
                for d in first..first + frags {
                    self.blockmap.set(d);
                    let rel = self.sb.dtogd(d) as usize;
                    if rel / 8 < cg.blksfree.len() {
                        clrbit(&mut cg.blksfree, rel);
                    }
                }
                if frags == frag {
                    cg.cs.nbfree -= 1;
                } else {
                    cg.cs.nffree -= frags as i32;
                }
                self.write_cg(c, &cg)?;
                self.n_blks += frags;
                debug!(blk = first, frags, "fragmentos asignados");
                return Ok(Some(first));
            }
            i += frag;
        }
        Ok(None)
    }

    /// Deshace un alloc_block que no llegó a usarse.
    pub(crate) fn return_block(&mut self, blk: Daddr, frags: i64) -> Result<()> {
        let c = self.sb.dtog(blk);
        let (mut cg, _) = self.read_cg(c)?;
        for d in blk..blk + frags {
            self.blockmap.clear(d);
            let rel = self.sb.dtogd(d) as usize;
            if rel / 8 < cg.blksfree.len() {
                setbit(&mut cg.blksfree, rel);
            }
        }
        if frags == i64::from(self.sb.frag) {
            cg.cs.nbfree += 1;
        } else {
            cg.cs.nffree += frags as i32;
        }
        self.write_cg(c, &cg)?;
        self.n_blks -= frags;
        Ok(())
    }

    /// Suelta un fragmento. Si otro inodo también lo reclamaba se queda
    /// marcado.
    pub(crate) fn release_frag(&mut self, d: Daddr) -> Visit {
        if self.chkrange(d, 1) {
            return Visit::SKIP;
        }
        if self.blockmap.test(d) && !self.dups.release(d) {
            self.blockmap.clear(d);
            self.n_blks -= 1;
        }
        Visit::KEEPON
    }

    pub fn free_blocks(&mut self, blk: Daddr, frags: i64) {
        for d in blk..blk + frags {
            self.release_frag(d);
        }
    }

    /// Libera todos los bloques alcanzables desde `dp`.
    pub(crate) fn release_blocks(&mut self, dp: &Dinode) -> Result<()> {
        self.walk(dp, |f, b| {
            let mut res = Visit::KEEPON;
            for d in b.blkno..b.blkno + b.frags {
                if f.release_frag(d) == Visit::SKIP {
                    res = Visit::SKIP;
                }
            }
            Ok(res)
        })?;
        Ok(())
    }

    /// Asigna un inodo libre (desde `request`, o desde la raíz si es 0) con
    /// un fragmento de datos.
    pub fn alloc_inode(&mut self, request: Ino, mode: u16) -> Result<Option<Ino>> {
        let start = if request == 0 {
            ROOTINO
        } else {
            if self.state(request).is_allocated() {
                return Ok(None);
            }
            request
        };
        let Some(ino) = (u64::from(start)..self.maxino)
            .map(|i| i as Ino)
            .find(|&i| !self.state(i).is_allocated())
        else {
            return Ok(None);
        };
        let state = match mode & IFMT {
            IFDIR => InodeState::Dir,
            IFREG | IFLNK => InodeState::File,
            _ => return Ok(None),
        };

        let c = self.sb.ino_to_cg(ino);
        let idx = i64::from(ino) % i64::from(self.sb.ipg);
        let mut cg = self.cg_for_update(c)?;
        setbit(&mut cg.inosused, idx as usize);
        cg.cs.nifree -= 1;
        if state == InodeState::Dir {
            cg.cs.ndir += 1;
        }
        if self.sb.is_ufs2() {
            let inopb = i64::from(self.sb.inopb);
            let bsize = self.sb.bsize as usize;
            // Los bloques de inodos aún sin usar en UFS2 pueden tener basura.
            while idx >= i64::from(cg.initediblk) && cg.initediblk < self.sb.ipg {
                let first = c * i64::from(self.sb.ipg) + i64::from(cg.initediblk);
                let blk = self.sb.ino_to_fsba(first as Ino);
                self.cache.install(blk, vec![0u8; bsize])?;
                cg.initediblk += inopb as i32;
            }
        }
        self.write_cg(c, &cg)?;
        self.inodes[ino as usize] = InodeStatus {
            state,
            dtype: iftodt(mode),
            links: 0,
        };

        let Some(blk) = self.alloc_block(1)? else {
            let (mut cg, _) = self.read_cg(c)?;
            clrbit(&mut cg.inosused, idx as usize);
            cg.cs.nifree += 1;
            if state == InodeState::Dir {
                cg.cs.ndir -= 1;
            }
            self.write_cg(c, &cg)?;
            self.inodes[ino as usize] = InodeStatus::default();
            return Ok(None);
        };

        let t = now();
        let fsize = i64::from(self.sb.fsize);
        let mut dp = Dinode {
            mode,
            size: fsize as u64,
            blocks: self.sb.btodb(fsize),
            atime: t,
            mtime: t,
            ctime: t,
            ..Dinode::default()
        };
        dp.db[0] = blk;
        self.put_inode(ino, &dp)?;
        self.n_files += 1;
        debug!(ino, blk, "inodo asignado");
        Ok(Some(ino))
    }

    pub fn free_inode(&mut self, ino: Ino) -> Result<()> {
        let dp = self.ginode(ino)?;
        self.release_blocks(&dp)?;
        self.clear_inode(ino)?;
        self.set_state(ino, InodeState::Unallocated);
        self.n_files = self.n_files.saturating_sub(1);
        debug!(ino, "inodo liberado");
        Ok(())
    }

    /// Fragmento inválido o duplicado en `ino`: el inodo se marcará para
    /// borrar.
    pub(crate) fn blkerror(&mut self, ino: Ino, kind: &'static str, blk: Daddr) -> Result<()> {
        self.pfatal(kind, format!("{blk} I={ino}"))?;
        match self.state(ino) {
            InodeState::File => self.set_state(ino, InodeState::FileClear),
            InodeState::Dir => self.set_state(ino, InodeState::DirClear),
            InodeState::FileClear | InodeState::DirClear => {}
            other => {
                return Err(FsckError::Fatal(format!("BAD STATE {other:?} TO BLKERR (I={ino})")));
            }
        }
        Ok(())
    }

    /// Descripción de un inodo para los mensajes.
    pub(crate) fn inode_desc(ino: Ino, dp: &Dinode) -> String {
        format!(
            "I={ino} OWNER={} MODE={:o} SIZE={} MTIME={}",
            dp.uid, dp.mode, dp.size, dp.mtime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::MemDevice;
    use crate::fsck::prompt::ScriptedOperator;
    use crate::mkfs::{build_image, MkfsParams, LOSTFOUNDINO};

    fn checked() -> Fsck<MemDevice> {
        let img = build_image(&MkfsParams::ufs2()).unwrap();
        let mut f = Fsck::new(
            MemDevice::new(img),
            FsckOptions::default(),
            Box::new(ScriptedOperator::new(true)),
        );
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f
    }

    #[test]
    fn chkrange_rejects_metadata_and_misaligned_runs() {
        let f = checked();
        let sb = f.sb.clone();
        assert!(f.chkrange(0, 1));
        assert!(f.chkrange(sb.size, 1));
        assert!(f.chkrange(sb.cgdmin(0), 0));
        assert!(!f.chkrange(sb.cgdmin(0), 8));
        assert!(f.chkrange(sb.cgdmin(0) + 4, 8));
        assert!(f.chkrange(sb.cgbase(1) + sb.sblkno as i64 + 1, 1));
        assert!(!f.chkrange(sb.cgdmin(1), 1));
    }

    #[test]
    fn alloc_block_is_first_fit() {
        let mut f = checked();
        let lf = f.ginode(LOSTFOUNDINO).unwrap().db[0];
        let one = f.alloc_block(1).unwrap().unwrap();
        assert_eq!(one, lf + 1);
        assert!(f.blockmap.test(one));
        let full = f.alloc_block(8).unwrap().unwrap();
        assert_eq!(full % 8, 0);
        assert!(full > one);
        let (cg, ok) = f.read_cg(0).unwrap();
        assert!(ok);
        assert!(!crate::cg::isset(&cg.blksfree, one as usize));
    }

    #[test]
    fn alloc_and_free_inode() {
        let mut f = checked();
        let before = f.n_files;
        let ino = f.alloc_inode(0, IFREG | 0o644).unwrap().unwrap();
        assert_eq!(ino, LOSTFOUNDINO + 1);
        assert_eq!(f.state(ino), InodeState::File);
        let dp = f.ginode(ino).unwrap();
        assert_eq!(dp.size, 1024);
        assert!(f.blockmap.test(dp.db[0]));
        assert_eq!(f.n_files, before + 1);

        f.free_inode(ino).unwrap();
        assert_eq!(f.state(ino), InodeState::Unallocated);
        assert!(!f.blockmap.test(dp.db[0]));
        assert_eq!(f.ginode(ino).unwrap(), Dinode::default());
        assert_eq!(f.alloc_inode(ROOTINO, IFREG).unwrap(), None);
    }
}
