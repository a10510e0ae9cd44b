// src/dir.rs
//
// Formato de las entradas de directorio:
//   ino u32 @0, reclen u16 @4, tipo u8 @6, namlen u8 @7, nombre @8
// terminado en NUL y rellenado hasta múltiplo de 4. El contenido se agrupa en
// trozos de DIRBLKSIZ bytes; ninguna entrada cruza un trozo.
//
// Los sistemas con el formato de inodos anterior a 4.4 guardan namlen como un
// u16 en @6; en una máquina little-endian eso equivale a tener los bytes 6 y 7
// intercambiados. `DirFormat::swapped` describe esa variante y todas las
// lecturas y escrituras pasan por aquí, así que el buffer siempre queda en el
// orden del disco.

use thiserror::Error;

use crate::fs::{get_u16, get_u32, put_u16, put_u32, Ino, Superblock};

pub const DIRBLKSIZ: usize = 512;
pub const MAXNAMLEN: usize = 255;
const DIRENT_HDR: usize = 8;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;
pub const DT_WHT: u8 = 14;
const DT_MAX: u8 = 15;

#[derive(Debug, Error)]
pub enum DirError {
    #[error("no es un directorio")]
    NotDirectory,
    #[error("espacio insuficiente")]
    NoSpace,
    #[error("inodo {0} fuera de rango")]
    OutOfRange(Ino),
    #[error("nombre demasiado largo ({0} bytes)")]
    NameTooLong(usize),
}

/// Espacio que ocupa una entrada con un nombre de `namlen` bytes.
pub fn dirsiz(namlen: usize) -> usize {
    DIRENT_HDR + ((namlen + 1 + 3) & !3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirFormat {
    /// Las entradas llevan tipo.
    pub has_type: bool,
    /// namlen y tipo intercambiados (formato antiguo en little-endian).
    pub swapped: bool,
}

impl Default for DirFormat {
    fn default() -> Self {
        Self {
            has_type: true,
            swapped: false,
        }
    }
}

impl DirFormat {
    /// Formato que corresponde al superblock; `swap` fuerza el intercambio.
    pub fn for_fs(sb: &Superblock, swap: Option<bool>) -> Self {
        let newfmt = sb.new_inode_format();
        Self {
            has_type: newfmt,
            swapped: swap.unwrap_or(!newfmt),
        }
    }

    fn namlen_at(&self) -> usize {
        if self.swapped {
            6
        } else {
            7
        }
    }

    fn type_at(&self) -> usize {
        if self.swapped {
            7
        } else {
            6
        }
    }

    pub fn ino(&self, b: &[u8], at: usize) -> Ino {
        get_u32(b, at)
    }

    pub fn reclen(&self, b: &[u8], at: usize) -> usize {
        usize::from(get_u16(b, at + 4))
    }

    pub fn namlen(&self, b: &[u8], at: usize) -> usize {
        usize::from(b[at + self.namlen_at()])
    }

    pub fn dtype(&self, b: &[u8], at: usize) -> u8 {
        if self.has_type {
            b[at + self.type_at()]
        } else {
            DT_UNKNOWN
        }
    }

    pub fn name<'a>(&self, b: &'a [u8], at: usize) -> &'a [u8] {
        let start = (at + DIRENT_HDR).min(b.len());
        let end = (start + self.namlen(b, at)).min(b.len());
        &b[start..end]
    }

    pub fn set_ino(&self, b: &mut [u8], at: usize, ino: Ino) {
        put_u32(b, at, ino);
    }

    pub fn set_reclen(&self, b: &mut [u8], at: usize, reclen: usize) {
        put_u16(b, at + 4, reclen as u16);
    }

    pub fn set_type(&self, b: &mut [u8], at: usize, dtype: u8) {
        b[at + self.type_at()] = if self.has_type { dtype } else { 0 };
    }

    /// Escribe una entrada completa en `b[at..at + reclen]`. El nombre debe
    /// caber en `reclen`.
    pub fn write_entry(&self, b: &mut [u8], at: usize, ino: Ino, reclen: usize, dtype: u8, name: &[u8]) {
        self.set_ino(b, at, ino);
        self.set_reclen(b, at, reclen);
        b[at + self.namlen_at()] = name.len() as u8;
        self.set_type(b, at, dtype);
        let start = at + DIRENT_HDR;
        let end = (at + dirsiz(name.len())).min(at + reclen);
        b[start..start + name.len()].copy_from_slice(name);
        b[start + name.len()..end].fill(0);
    }
}

/// Valida la entrada que empieza en `b[0]` con `space` bytes restantes en su
/// trozo. No modifica nada.
pub fn validate_entry(b: &[u8], space: usize, maxino: u64, fmt: DirFormat) -> bool {
    if b.len() < DIRENT_HDR {
        return false;
    }
    let ino = fmt.ino(b, 0);
    let reclen = fmt.reclen(b, 0);
    if u64::from(ino) >= maxino || reclen == 0 || reclen > space || reclen & 3 != 0 || reclen > b.len() {
        return false;
    }
    if ino == 0 {
        return true;
    }
    let namlen = fmt.namlen(b, 0);
    if namlen > MAXNAMLEN || fmt.dtype(b, 0) > DT_MAX || reclen < dirsiz(namlen) {
        return false;
    }
    let name = &b[DIRENT_HDR..DIRENT_HDR + namlen];
    if name.iter().any(|&c| c == 0 || c == b'/') {
        return false;
    }
    b[DIRENT_HDR + namlen] == 0
}

/// Rellena `b` (múltiplo de DIRBLKSIZ) con trozos vacíos.
pub fn empty_chunks(b: &mut [u8], fmt: DirFormat) {
    for at in (0..b.len()).step_by(DIRBLKSIZ) {
        b[at..at + DIRBLKSIZ].fill(0);
        fmt.set_reclen(b, at, DIRBLKSIZ);
    }
}

/// Bloque inicial de un directorio nuevo: "." y ".." en el primer trozo y el
/// resto vacío.
pub fn dir_template(b: &mut [u8], fmt: DirFormat, ino: Ino, parent: Ino) {
    empty_chunks(b, fmt);
    let dot = dirsiz(1);
    fmt.write_entry(b, 0, ino, dot, DT_DIR, b".");
    fmt.write_entry(b, dot, parent, DIRBLKSIZ - dot, DT_DIR, b"..");
}

/// Copia de un registro completo (entrada más su holgura), tal como la ven
/// los visitantes del escáner de directorios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    raw: Vec<u8>,
    fmt: DirFormat,
}

impl DirRecord {
    pub fn from_bytes(b: &[u8], fmt: DirFormat) -> Self {
        Self { raw: b.to_vec(), fmt }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Acceso crudo para reparaciones que parten el registro en varias
    /// entradas.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.raw
    }

    pub fn format(&self) -> DirFormat {
        self.fmt
    }

    pub fn ino(&self) -> Ino {
        self.fmt.ino(&self.raw, 0)
    }

    pub fn set_ino(&mut self, ino: Ino) {
        self.fmt.set_ino(&mut self.raw, 0, ino);
    }

    pub fn reclen(&self) -> usize {
        self.fmt.reclen(&self.raw, 0)
    }

    pub fn set_reclen(&mut self, reclen: usize) {
        self.fmt.set_reclen(&mut self.raw, 0, reclen);
    }

    pub fn namlen(&self) -> usize {
        self.fmt.namlen(&self.raw, 0)
    }

    pub fn dtype(&self) -> u8 {
        self.fmt.dtype(&self.raw, 0)
    }

    pub fn set_type(&mut self, dtype: u8) {
        self.fmt.set_type(&mut self.raw, 0, dtype);
    }

    pub fn has_type(&self) -> bool {
        self.fmt.has_type
    }

    pub fn name(&self) -> &[u8] {
        let n = self.namlen().min(self.raw.len().saturating_sub(DIRENT_HDR));
        &self.raw[DIRENT_HDR..DIRENT_HDR + n]
    }

    /// Reescribe la entrada con `name`, conservando reclen.
    pub fn rename(&mut self, ino: Ino, dtype: u8, name: &[u8]) {
        let reclen = self.reclen();
        self.fmt.write_entry(&mut self.raw, 0, ino, reclen, dtype, name);
    }

    /// Bytes sobrantes tras el nombre de esta entrada.
    pub fn slack(&self) -> usize {
        if self.ino() == 0 {
            self.reclen()
        } else {
            self.reclen().saturating_sub(dirsiz(self.namlen()))
        }
    }

    /// Aloja una entrada nueva en la holgura de este registro. Devuelve false
    /// si no cabe.
    pub fn split_for(&mut self, ino: Ino, dtype: u8, name: &[u8]) -> bool {
        let need = dirsiz(name.len());
        if self.slack() < need {
            return false;
        }
        let reclen = self.reclen();
        if self.ino() == 0 {
            self.fmt.write_entry(&mut self.raw, 0, ino, reclen, dtype, name);
            return true;
        }
        let keep = dirsiz(self.namlen());
        self.set_reclen(keep);
        self.fmt.write_entry(&mut self.raw, keep, ino, reclen - keep, dtype, name);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MAXINO: u64 = 4096;

    fn chunk() -> Vec<u8> {
        let mut b = vec![0u8; DIRBLKSIZ];
        empty_chunks(&mut b, DirFormat::default());
        b
    }

    #[test]
    fn zero_reclen_is_rejected() {
        let mut b = chunk();
        let fmt = DirFormat::default();
        fmt.write_entry(&mut b, 0, 5, 100, DT_REG, b"a");
        fmt.set_reclen(&mut b, 0, 0);
        assert!(!validate_entry(&b, 100, MAXINO, fmt));
    }

    #[test]
    fn empty_chunk_is_valid() {
        let b = chunk();
        assert!(validate_entry(&b, DIRBLKSIZ, MAXINO, DirFormat::default()));
    }

    #[test]
    fn framing_rules() {
        let fmt = DirFormat::default();
        let mut b = chunk();
        fmt.write_entry(&mut b, 0, 7, DIRBLKSIZ, DT_REG, b"hola");
        assert!(validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));

        // Inodo fuera de rango.
        fmt.set_ino(&mut b, 0, MAXINO as Ino);
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        fmt.set_ino(&mut b, 0, 7);

        // reclen no alineado o mayor que el espacio.
        fmt.set_reclen(&mut b, 0, 14);
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        fmt.set_reclen(&mut b, 0, DIRBLKSIZ);
        assert!(!validate_entry(&b, 256, MAXINO, fmt));

        // reclen menor que lo que ocupa el nombre.
        fmt.set_reclen(&mut b, 0, 12);
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        fmt.set_reclen(&mut b, 0, DIRBLKSIZ);

        // Separador dentro del nombre.
        b[9] = b'/';
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        b[9] = b'o';

        // Falta el NUL final.
        b[12] = b'x';
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        b[12] = 0;

        // Tipo inválido.
        fmt.set_type(&mut b, 0, 16);
        assert!(!validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
    }

    #[test]
    fn swapped_format_keeps_disk_order() {
        let fmt = DirFormat {
            has_type: false,
            swapped: true,
        };
        let mut b = chunk();
        fmt.write_entry(&mut b, 0, 3, DIRBLKSIZ, DT_DIR, b"abc");
        // u16 namlen en @6.
        assert_eq!(get_u16(&b, 6), 3);
        assert_eq!(fmt.namlen(&b, 0), 3);
        assert_eq!(fmt.dtype(&b, 0), DT_UNKNOWN);
        assert!(validate_entry(&b, DIRBLKSIZ, MAXINO, fmt));
        // Leído con el formato nuevo, el tipo aparece como namlen.
        let new = DirFormat::default();
        assert_eq!(new.dtype(&b, 0), 3);
        assert_eq!(new.namlen(&b, 0), 0);
    }

    #[test]
    fn template_has_dot_and_dotdot() {
        let fmt = DirFormat::default();
        let mut b = vec![0u8; 2 * DIRBLKSIZ];
        dir_template(&mut b, fmt, 9, 2);
        assert_eq!(fmt.ino(&b, 0), 9);
        assert_eq!(fmt.reclen(&b, 0), 12);
        assert_eq!(fmt.ino(&b, 12), 2);
        assert_eq!(fmt.reclen(&b, 12), DIRBLKSIZ - 12);
        assert_eq!(fmt.namlen(&b, 12), 2);
        assert!(validate_entry(&b[12..], DIRBLKSIZ - 12, MAXINO, fmt));
        assert!(validate_entry(&b[DIRBLKSIZ..], DIRBLKSIZ, MAXINO, fmt));
    }

    #[test]
    fn split_uses_slack() {
        let fmt = DirFormat::default();
        let mut b = chunk();
        dir_template(&mut b, fmt, 9, 2);
        let mut rec = DirRecord::from_bytes(&b[12..DIRBLKSIZ], fmt);
        assert!(rec.split_for(40, DT_REG, b"nuevo"));
        assert_eq!(rec.reclen(), 12);
        let tail = &rec.bytes()[12..];
        assert_eq!(fmt.ino(tail, 0), 40);
        assert_eq!(fmt.reclen(tail, 0), DIRBLKSIZ - 24);
        assert!(validate_entry(tail, DIRBLKSIZ - 24, MAXINO, fmt));

        let mut full = DirRecord::from_bytes(&b[0..12], fmt);
        assert!(!full.split_for(41, DT_REG, b"x"));
    }

    proptest! {
        #[test]
        fn validation_is_idempotent(bytes in proptest::collection::vec(any::<u8>(), 8..DIRBLKSIZ), space in 0usize..DIRBLKSIZ) {
            let fmt = DirFormat::default();
            let before = bytes.clone();
            let a = validate_entry(&bytes, space, MAXINO, fmt);
            let b = validate_entry(&bytes, space, MAXINO, fmt);
            prop_assert_eq!(a, b);
            prop_assert_eq!(before, bytes);
        }
    }
}
