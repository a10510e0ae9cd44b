/*Recorrido de directorios. scan_directory entrega cada entrada válida a un
visitante y, si el visitante la cambia, la devuelve al bloque en caché.
Los trozos dañados se rescatan al pasar: una entrada inválida al inicio de
un trozo vacía el trozo completo y una inválida en medio se absorbe en el
reclen de la anterior.

Encima de eso viven las operaciones que editan directorios: buscar y
cambiar entradas, insertar (expandiendo si hace falta), crear y borrar
directorios y armar rutas para los mensajes.*/

use tracing::{debug, warn};

use crate::dir::{dir_template, empty_chunks, validate_entry, DirError, DirRecord, DIRBLKSIZ, MAXNAMLEN};
use crate::fs::{howmany, Daddr, Ino, NDADDR, ROOTINO};
use crate::inode::{BlockRef, Dinode, Visit, IFDIR};

use super::error::{FsckError, Result};
use super::fsck::Fsck;
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

/// Qué hacer con un trozo de directorio dañado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFix {
    /// Preguntar la primera vez; la respuesta vale para el resto del directorio.
    DontKnow,
    Fix,
    NoFix,
    /// Sólo lectura: al primer daño se deja de leer el bloque.
    Ignore,
}

struct ScanState {
    ino: Ino,
    /// Bytes del directorio que faltan por leer.
    filesize: i64,
    fix: ScanFix,
    blk: i64,
    blksiz: usize,
    loc: usize,
}

impl<D: Device> Fsck<D> {
    /// Recorre las entradas del directorio `ino` (con inodo `dp`). Devuelve
    /// la visita que lo detuvo, o `KEEPON`/`STOP` según quedaran bytes.
    pub(crate) fn scan_directory<F>(&mut self, ino: Ino, dp: &Dinode, fix: ScanFix, mut visit: F) -> Result<Visit>
    where
        F: FnMut(&mut Self, &mut DirRecord) -> Result<Visit>,
    {
        let mut st = ScanState {
            ino,
            filesize: howmany(dp.size as i64, DIRBLKSIZ as i64) * DIRBLKSIZ as i64,
            fix,
            blk: 0,
            blksiz: 0,
            loc: 0,
        };
        self.walk(dp, |f, b| {
            if b.level > 0 {
                let frag = i64::from(f.sb.frag);
                return Ok(if f.chkrange(b.blkno, frag) { Visit::SKIP } else { Visit::KEEPON });
            }
            f.scan_block(b, &mut st, &mut visit)
        })
    }

    fn scan_block<F>(&mut self, b: &BlockRef, st: &mut ScanState, visit: &mut F) -> Result<Visit>
    where
        F: FnMut(&mut Self, &mut DirRecord) -> Result<Visit>,
    {
        let blksiz = (b.frags * i64::from(self.sb.fsize)) as usize;
        if self.chkrange(b.blkno, b.frags) {
            st.filesize -= blksiz as i64;
            return Ok(Visit::SKIP);
        }
        st.blk = b.blkno;
        st.blksiz = blksiz;
        st.loc = 0;
        while let Some((at, mut rec)) = self.next_entry(st)? {
            let res = visit(self, &mut rec)?;
            if res.has(Visit::ALTERED) {
                let raw = rec.bytes();
                let cb = self.cache.get_dir(st.blk, st.blksiz)?;
                cb.data[at..at + raw.len()].copy_from_slice(raw);
                cb.dirty = true;
            }
            if res.has(Visit::STOP) {
                return Ok(res);
            }
        }
        Ok(if st.filesize > 0 { Visit::KEEPON } else { Visit::STOP })
    }

    /// Siguiente entrada del bloque en curso, con su posición. Repara (o
    /// salta) lo que no pasa la validación.
    fn next_entry(&mut self, st: &mut ScanState) -> Result<Option<(usize, DirRecord)>> {
        let fmt = self.dirfmt;
        let maxino = self.maxino;

        if st.loc % DIRBLKSIZ == 0 && st.filesize > 0 && st.loc < st.blksiz {
            let at = st.loc;
            let cb = self.cache.get_dir(st.blk, st.blksiz)?;
            if !validate_entry(&cb.data[at..at + DIRBLKSIZ], DIRBLKSIZ, maxino, fmt) {
                if st.fix == ScanFix::Ignore {
                    return Ok(None);
                }
                if self.dofix(st, "DIRECTORY CORRUPTED")? {
                    let cb = self.cache.get_dir(st.blk, st.blksiz)?;
                    empty_chunks(&mut cb.data[at..at + DIRBLKSIZ], fmt);
                    cb.dirty = true;
                }
                st.loc += DIRBLKSIZ;
                st.filesize -= DIRBLKSIZ as i64;
                let mut empty = vec![0u8; DIRBLKSIZ];
                empty_chunks(&mut empty, fmt);
                return Ok(Some((at, DirRecord::from_bytes(&empty, fmt))));
            }
        }

        if st.filesize <= 0 || st.loc >= st.blksiz {
            return Ok(None);
        }
        let at = st.loc;
        let cb = self.cache.get_dir(st.blk, st.blksiz)?;
        let mut reclen = fmt.reclen(&cb.data, at);
        st.loc += reclen;
        st.filesize -= reclen as i64;

        let loc = st.loc;
        if loc < st.blksiz && st.filesize > 0 && loc % DIRBLKSIZ != 0 {
            let space = DIRBLKSIZ - loc % DIRBLKSIZ;
            if !validate_entry(&cb.data[loc..loc + space], space, maxino, fmt) {
                if st.fix == ScanFix::Ignore {
                    return Ok(None);
                }
                st.loc += space;
                st.filesize -= space as i64;
                if self.dofix(st, "DIRECTORY CORRUPTED")? {
                    reclen += space;
                    let cb = self.cache.get_dir(st.blk, st.blksiz)?;
                    fmt.set_reclen(&mut cb.data, at, reclen);
                    cb.dirty = true;
                }
            }
        }

        let cb = self.cache.get_dir(st.blk, st.blksiz)?;
        let end = (at + reclen).min(cb.data.len());
        Ok(Some((at, DirRecord::from_bytes(&cb.data[at..end], fmt))))
    }

    /// La respuesta a la primera pregunta vale para todo el directorio.
    fn dofix(&mut self, st: &mut ScanState, tag: &'static str) -> Result<bool> {
        match st.fix {
            ScanFix::DontKnow => {
                let detail = self.dir_detail(st.ino)?;
                let q = Question::new(tag, "SALVAGE").detail(detail).preen(PreenPolicy::Fix);
                let yes = self.ask(q)?;
                st.fix = if yes { ScanFix::Fix } else { ScanFix::NoFix };
                Ok(yes)
            }
            ScanFix::Fix => Ok(true),
            ScanFix::NoFix | ScanFix::Ignore => Ok(false),
        }
    }

    /// Hace que la entrada `name` de `dir` apunte a `newino`.
    pub(crate) fn change_entry_owner(&mut self, dir: Ino, name: &[u8], newino: Ino) -> Result<bool> {
        let dp = self.ginode(dir)?;
        let dtype = self.status(newino).dtype;
        let res = self.scan_directory(dir, &dp, ScanFix::DontKnow, |_, rec| {
            if rec.ino() == 0 || rec.name() != name {
                return Ok(Visit::KEEPON);
            }
            rec.set_ino(newino);
            if rec.has_type() {
                rec.set_type(dtype);
            }
            Ok(Visit::ALTERED | Visit::STOP)
        })?;
        Ok(res.has(Visit::ALTERED))
    }

    /// Inodo al que apunta la entrada `name` de `dir`.
    pub fn find_entry(&mut self, dir: Ino, name: &[u8]) -> Result<Option<Ino>> {
        let dp = self.ginode(dir)?;
        let maxino = self.maxino;
        let mut found = None;
        self.scan_directory(dir, &dp, ScanFix::DontKnow, |_, rec| {
            let ino = rec.ino();
            if ino < ROOTINO || u64::from(ino) >= maxino || rec.name() != name {
                return Ok(Visit::KEEPON);
            }
            found = Some(ino);
            Ok(Visit::FOUND | Visit::STOP)
        })?;
        Ok(found)
    }

    /// Nombre con el que `dir` enlaza a `child`, sin tocar nada.
    pub(crate) fn find_name(&mut self, dir: Ino, child: Ino) -> Result<Option<Vec<u8>>> {
        if !self.state(dir).is_dir() {
            return Ok(None);
        }
        let dp = self.ginode(dir)?;
        let mut found = None;
        self.scan_directory(dir, &dp, ScanFix::Ignore, |_, rec| {
            let name = rec.name();
            if rec.ino() != child || name == b"." || name == b".." {
                return Ok(Visit::KEEPON);
            }
            found = Some(name.to_vec());
            Ok(Visit::FOUND | Visit::STOP)
        })?;
        Ok(found)
    }

    /// Ruta de un directorio armada con el árbol; "?" donde no se sabe.
    pub fn pathname(&mut self, ino: Ino) -> Result<String> {
        if ino == ROOTINO {
            return Ok("/".into());
        }
        let mut parts: Vec<String> = Vec::new();
        let mut cur = ino;
        let mut reached_root = false;
        for _ in 0..=self.dirs.len() {
            if cur == ROOTINO {
                reached_root = true;
                break;
            }
            let parent = match self.dirs.get(cur) {
                Some(n) if n.parent != 0 => n.parent,
                Some(n) if n.dotdot != 0 && u64::from(n.dotdot) < self.maxino => n.dotdot,
                // Antes de la fase 2 el árbol no sabe nada: se lee ".." del disco.
                _ => self.disk_dotdot(cur)?.unwrap_or(0),
            };
            if parent == 0 || parent == cur {
                break;
            }
            match self.find_name(parent, cur)? {
                Some(name) => parts.push(String::from_utf8_lossy(&name).into_owned()),
                None => {
                    parts.push("?".into());
                    break;
                }
            }
            cur = parent;
        }
        parts.reverse();
        let tail = parts.join("/");
        Ok(if reached_root { format!("/{tail}") } else { format!("?/{tail}") })
    }

    /// La entrada ".." de `dir` tal como está en disco, sin reparar nada.
    fn disk_dotdot(&mut self, dir: Ino) -> Result<Option<Ino>> {
        if dir < ROOTINO || u64::from(dir) >= self.maxino || !self.state(dir).is_dir() {
            return Ok(None);
        }
        let dp = self.ginode(dir)?;
        let maxino = self.maxino;
        let mut found = None;
        self.scan_directory(dir, &dp, ScanFix::Ignore, |_, rec| {
            let ino = rec.ino();
            if rec.name() != b".." || ino < ROOTINO || u64::from(ino) >= maxino {
                return Ok(Visit::KEEPON);
            }
            found = Some(ino);
            Ok(Visit::FOUND | Visit::STOP)
        })?;
        Ok(found)
    }

    /// Descripción de un directorio para los mensajes.
    pub(crate) fn dir_detail(&mut self, ino: Ino) -> Result<String> {
        if u64::from(ino) >= self.maxino {
            return Ok(format!("I={ino} I OUT OF RANGE"));
        }
        let dp = self.ginode(ino)?;
        let path = self.pathname(ino)?;
        Ok(format!("{} DIR={path}", Self::inode_desc(ino, &dp)))
    }

    /// Descripción de la entrada de `dir` que apunta a `ino`.
    pub(crate) fn entry_detail(&mut self, dir: Ino, ino: Ino) -> Result<String> {
        if u64::from(ino) >= self.maxino {
            return Ok(format!("I={ino} I OUT OF RANGE"));
        }
        let dp = self.ginode(ino)?;
        let desc = Self::inode_desc(ino, &dp);
        if dp.mode & crate::inode::IFMT == IFDIR {
            let path = self.pathname(ino)?;
            return Ok(format!("{desc} DIR={path}"));
        }
        let mut path = self.pathname(dir)?;
        let name = self.find_name(dir, ino)?;
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&name.map_or_else(|| "?".into(), |n| String::from_utf8_lossy(&n).into_owned()));
        Ok(format!("{desc} FILE={path}"))
    }

    /// Agrega la entrada `name` -> `ino` en `parent`, expandiendo el
    /// directorio una vez si no hay hueco.
    pub fn insert_entry(&mut self, parent: Ino, ino: Ino, name: &[u8]) -> Result<bool> {
        if name.len() > MAXNAMLEN {
            return Err(DirError::NameTooLong(name.len()).into());
        }
        if parent < ROOTINO || u64::from(parent) >= self.maxino || ino < ROOTINO || u64::from(ino) >= self.maxino {
            return Ok(false);
        }
        let mut dp = self.ginode(parent)?;
        if dp.size % DIRBLKSIZ as u64 != 0 {
            dp.size = howmany(dp.size as i64, DIRBLKSIZ as i64) as u64 * DIRBLKSIZ as u64;
            self.put_inode(parent, &dp)?;
        }
        if self.try_insert(parent, ino, name)? {
            return Ok(true);
        }
        if !self.expand_directory(parent)? {
            return Ok(false);
        }
        self.try_insert(parent, ino, name)
    }

    fn try_insert(&mut self, parent: Ino, ino: Ino, name: &[u8]) -> Result<bool> {
        let dp = self.ginode(parent)?;
        let dtype = self.status(ino).dtype;
        let res = self.scan_directory(parent, &dp, ScanFix::DontKnow, |_, rec| {
            if rec.split_for(ino, dtype, name) {
                Ok(Visit::ALTERED | Visit::STOP)
            } else {
                Ok(Visit::KEEPON)
            }
        })?;
        if res.has(Visit::ALTERED) {
            debug!(parent, ino, name = %String::from_utf8_lossy(name), "entrada agregada");
        }
        Ok(res.has(Visit::ALTERED))
    }

    /// Agrega un bloque entero al directorio. Si algo falla antes de
    /// confirmar, o el operador no quiere, el bloque vuelve al mapa y el
    /// inodo queda como estaba.
    pub(crate) fn expand_directory(&mut self, dir: Ino) -> Result<bool> {
        let dp = self.ginode(dir)?;
        let frag = i64::from(self.sb.frag);
        let size = dp.size as i64;
        let lastbn = self.sb.lblkno(size);
        let partial = self.sb.blkoff(size) != 0;
        let fits = if partial {
            lastbn < NDADDR as i64 - 1 && dp.db[lastbn as usize] != 0
        } else {
            lastbn < NDADDR as i64 && dp.db[lastbn as usize] == 0
        };
        if size == 0 || !fits {
            return Ok(false);
        }
        let Some(newblk) = self.alloc_block(frag)? else {
            return Ok(false);
        };
        match self.attach_dir_block(dir, dp, lastbn, partial, newblk) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.return_block(newblk, frag)?;
                Ok(false)
            }
            Err(e) => {
                self.return_block(newblk, frag)?;
                Err(e)
            }
        }
    }

    /// Segunda mitad de expand_directory, con `newblk` ya reservado.
    fn attach_dir_block(&mut self, dir: Ino, mut dp: Dinode, lastbn: i64, partial: bool, newblk: Daddr) -> Result<bool> {
        let bsize = i64::from(self.sb.bsize);
        let fmt = self.dirfmt;
        let lbn = lastbn as usize;

        let mut data = vec![0u8; bsize as usize];
        empty_chunks(&mut data, fmt);
        let old = dp.db[lbn];
        let oldsz = self.sb.blksize(dp.size, lastbn) as usize;
        if partial {
            match self.cache.get_dir(old, oldsz) {
                Ok(cb) => data[..DIRBLKSIZ].copy_from_slice(&cb.data[..DIRBLKSIZ]),
                Err(e @ FsckError::Io { .. }) => {
                    warn!(dir, error = %e, "no se pudo leer el último bloque del directorio");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let path = self.pathname(dir)?;
        let q = Question::new("NO SPACE LEFT IN", "EXPAND").detail(path).preen(PreenPolicy::Fix);
        if !self.ask(q)? {
            return Ok(false);
        }

        self.cache.install(newblk, data)?;
        if partial {
            let cb = self.cache.get_dir(old, oldsz)?;
            empty_chunks(&mut cb.data[..DIRBLKSIZ], fmt);
            cb.dirty = true;
            dp.db[lbn + 1] = old;
        }
        dp.db[lbn] = newblk;
        dp.size += bsize as u64;
        dp.blocks += self.sb.btodb(bsize);
        self.put_inode(dir, &dp)?;
        self.dirs.insert(dir, &dp, bsize);
        debug!(dir, blk = newblk, "directorio expandido");
        Ok(true)
    }

    /// Crea un directorio vacío bajo `parent`. El nuevo hereda el estado del
    /// padre; si el padre no es un directorio válido no se crea nada.
    pub fn alloc_dir(&mut self, parent: Ino, request: Ino, mode: u16) -> Result<Option<Ino>> {
        let Some(ino) = self.alloc_inode(request, IFDIR | mode)? else {
            return Ok(None);
        };
        let mut dp = self.ginode(ino)?;
        let mut data = vec![0u8; self.sb.fsize as usize];
        dir_template(&mut data, self.dirfmt, ino, parent);
        self.cache.install(dp.db[0], data)?;
        dp.nlink = 2;
        self.put_inode(ino, &dp)?;
        let bsize = i64::from(self.sb.bsize);

        if ino == ROOTINO {
            self.inodes[ino as usize].links = i32::from(dp.nlink);
            self.dirs.insert(ino, &dp, bsize);
            return Ok(Some(ino));
        }
        let pstate = self.state(parent);
        if !matches!(pstate, InodeState::Dir | InodeState::DirFound) {
            self.free_inode(ino)?;
            return Ok(None);
        }
        self.dirs.insert(ino, &dp, bsize);
        if let Some(n) = self.dirs.get_mut(ino) {
            n.parent = parent;
            n.dotdot = parent;
        }
        self.set_state(ino, pstate);
        if pstate == InodeState::Dir {
            self.inodes[ino as usize].links = i32::from(dp.nlink);
            self.add_links(parent, 1);
        }
        let mut pdp = self.ginode(parent)?;
        pdp.nlink += 1;
        self.put_inode(parent, &pdp)?;
        debug!(ino, parent, "directorio creado");
        Ok(Some(ino))
    }

    pub(crate) fn free_dir(&mut self, ino: Ino, parent: Ino) -> Result<()> {
        if ino != parent {
            let mut pdp = self.ginode(parent)?;
            pdp.nlink -= 1;
            self.put_inode(parent, &pdp)?;
        }
        self.free_inode(ino)
    }
}
