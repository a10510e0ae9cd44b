/*Estructuras básicas del fsck:
estado de cada inodo, mapa de fragmentos reconstruido, lista de bloques
duplicados y el reporte final (donde se acumulan los problemas). */

use std::collections::HashMap;

use crate::fs::Daddr;

use super::error::FsckError;

/// Estado de un inodo a lo largo de las pasadas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InodeState {
    #[default]
    Unallocated,
    File,
    Dir,
    /// Directorio alcanzable desde la raíz.
    DirFound,
    DirClear,
    FileClear,
}

impl InodeState {
    pub fn is_dir(self) -> bool {
        matches!(self, InodeState::Dir | InodeState::DirFound | InodeState::DirClear)
    }

    pub fn is_allocated(self) -> bool {
        self != InodeState::Unallocated
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InodeStatus {
    pub state: InodeState,
    /// Tipo de entrada de directorio (DT_*).
    pub dtype: u8,
    /// Referencias que faltan por encontrar.
    pub links: i32,
}

/// Reserva exacta de `n` elementos; el fallo se reporta como falta de memoria
/// para la tabla `what`.
pub(crate) fn alloc_table<T: Clone>(n: usize, fill: T, what: &'static str) -> Result<Vec<T>, FsckError> {
    let mut v = Vec::new();
    v.try_reserve_exact(n).map_err(|_| FsckError::NoMemory(what))?;
    v.resize(n, fill);
    Ok(v)
}

/// Un bit por fragmento: puesto si algún inodo vivo (o el propio sistema de
/// archivos) lo reclama.
#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    bits: Vec<u8>,
    nfrags: u64,
}

impl BlockMap {
    pub fn try_new(nfrags: u64) -> Result<Self, FsckError> {
        // Redondeado a u16 como el mapa en disco.
        let bytes = (nfrags.div_ceil(8) as usize + 1) & !1;
        Ok(Self {
            bits: alloc_table(bytes, 0u8, "blockmap")?,
            nfrags,
        })
    }

    pub fn len(&self) -> u64 {
        self.nfrags
    }

    pub fn is_empty(&self) -> bool {
        self.nfrags == 0
    }

    pub fn test(&self, d: Daddr) -> bool {
        if d < 0 || d as u64 >= self.nfrags {
            return false;
        }
        self.bits[d as usize / 8] & (1 << (d % 8)) != 0
    }

    pub fn set(&mut self, d: Daddr) {
        if d >= 0 && (d as u64) < self.nfrags {
            self.bits[d as usize / 8] |= 1 << (d % 8);
        }
    }

    pub fn clear(&mut self, d: Daddr) {
        if d >= 0 && (d as u64) < self.nfrags {
            self.bits[d as usize / 8] &= !(1 << (d % 8));
        }
    }

    pub fn count(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }
}

/// Fragmentos reclamados más de una vez. `claims` cuenta todas las
/// reclamaciones (incluida la primera, que no fue duplicada); `order` guarda
/// los fragmentos distintos en el orden en que se detectaron.
#[derive(Debug, Clone, Default)]
pub struct DupBlocks {
    claims: HashMap<Daddr, u32>,
    order: Vec<Daddr>,
}

impl DupBlocks {
    /// Registra una reclamación repetida de `d`. Devuelve true si es la
    /// primera vez que `d` aparece como duplicado.
    pub fn claim(&mut self, d: Daddr) -> Result<bool, FsckError> {
        if let Some(n) = self.claims.get_mut(&d) {
            *n += 1;
            return Ok(false);
        }
        self.claims.try_reserve(1).map_err(|_| FsckError::NoMemory("duplist"))?;
        self.order.try_reserve(1).map_err(|_| FsckError::NoMemory("duplist"))?;
        self.claims.insert(d, 2);
        self.order.push(d);
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn contains(&self, d: Daddr) -> bool {
        self.claims.contains_key(&d)
    }

    /// Reclamaciones registradas de `d` (0 si no es duplicado).
    pub fn claims(&self, d: Daddr) -> u32 {
        self.claims.get(&d).copied().unwrap_or(0)
    }

    /// Fragmentos duplicados distintos, en orden de detección.
    pub fn distinct(&self) -> impl Iterator<Item = Daddr> + '_ {
        self.order.iter().copied().filter(|d| self.claims.contains_key(d))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Un dueño suelta `d`. Devuelve true si otro dueño lo sigue reclamando
    /// (el fragmento no debe liberarse).
    pub fn release(&mut self, d: Daddr) -> bool {
        match self.claims.get_mut(&d) {
            Some(n) if *n > 2 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.claims.remove(&d);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.claims.clear();
        self.order.clear();
    }
}

/// Resumen de la corrida.
#[derive(Debug, Default)]
pub struct FsckReport {
    pub blocks_ok: bool,
    pub inodes_ok: bool,
    /// Cada inconsistencia reportada, con su etiqueta.
    pub errors: Vec<String>,
    /// Etiquetas en el orden en que aparecieron.
    pub tags: Vec<&'static str>,
    pub fixed: usize,
    pub unresolved: usize,
    pub modified: bool,
    pub marked_clean: bool,
    /// Se omitió la revisión (sistema limpio en modo preen).
    pub skipped: bool,
    pub files: u64,
    pub used_frags: i64,
    pub free_frags: i64,
    pub free_blocks: i64,
}

impl FsckReport {
    pub fn new() -> Self {
        Self {
            blocks_ok: true,
            inodes_ok: true,
            ..Self::default()
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| *t == tag)
    }

    pub fn count_tag(&self, tag: &str) -> usize {
        self.tags.iter().filter(|t| **t == tag).count()
    }

    /// Código de salida de fsck: 0 si todo quedó resuelto, 8 si no.
    pub fn exit_code(&self) -> i32 {
        if self.unresolved == 0 {
            0
        } else {
            8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_counts_every_claim() {
        let mut d = DupBlocks::default();
        assert!(d.claim(100).unwrap());
        assert_eq!(d.claims(100), 2);
        assert!(!d.claim(100).unwrap());
        assert_eq!(d.claims(100), 3);
        assert_eq!(d.distinct().collect::<Vec<_>>(), vec![100]);
    }

    #[test]
    fn release_keeps_block_until_last_owner() {
        let mut d = DupBlocks::default();
        d.claim(7).unwrap();
        d.claim(7).unwrap();
        assert!(d.release(7));
        assert_eq!(d.claims(7), 2);
        assert!(d.release(7));
        assert!(!d.contains(7));
        assert!(!d.release(7));
    }

    #[test]
    fn blockmap_ignores_out_of_range() {
        let mut m = BlockMap::try_new(20).unwrap();
        m.set(3);
        m.set(25);
        m.set(-1);
        assert!(m.test(3));
        assert!(!m.test(25));
        assert_eq!(m.count(), 1);
        m.clear(3);
        assert!(!m.test(3));
    }
}
