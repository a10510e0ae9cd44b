// Árbol de directorios que arma pass1 y completa pass2. Vive en un arena
// (Vec) indexado por posición; los enlaces padre/hijo/hermano son índices.

use std::collections::HashMap;

use tracing::warn;

use crate::fs::{howmany, Daddr, Ino, NDADDR, NIADDR, ROOTINO};
use crate::inode::{Dinode, IFDIR};

use super::error::{FsckError, Result};
use super::fsck::Fsck;
use super::fsck_backend::Device;
use super::fsck_types::InodeState;

/// ".." que no se pudo reparar.
pub const DOTDOT_UNFIXABLE: Ino = Ino::MAX;

#[derive(Debug, Clone)]
pub struct DirNode {
    pub ino: Ino,
    /// Directorio donde se encontró la entrada que apunta aquí (0: ninguno).
    pub parent: Ino,
    /// Lo que dice la entrada "..", 0 si falta.
    pub dotdot: Ino,
    pub isize: u64,
    /// Punteros directos, más los indirectos si el tamaño los usa.
    pub blks: Vec<Daddr>,
    child: Option<usize>,
    sibling: Option<usize>,
}

impl DirNode {
    fn new(ino: Ino, dp: &Dinode, bsize: i64) -> Self {
        let mut n = howmany(dp.size.min(i64::MAX as u64) as i64, bsize).max(0) as usize;
        if n > NDADDR {
            n = NDADDR + NIADDR;
        }
        let mut blks = Vec::with_capacity(n);
        for i in 0..n {
            blks.push(if i < NDADDR { dp.db[i] } else { dp.ib[i - NDADDR] });
        }
        let root = if ino == ROOTINO { ROOTINO } else { 0 };
        Self {
            ino,
            parent: root,
            dotdot: 0,
            isize: dp.size,
            blks,
            child: None,
            sibling: None,
        }
    }

    /// Inodo sintético con los punteros guardados, para recorrer el
    /// directorio sin volver a leer su inodo.
    pub fn as_dinode(&self) -> Dinode {
        let mut dp = Dinode {
            mode: IFDIR,
            size: self.isize,
            ..Dinode::default()
        };
        for (i, &b) in self.blks.iter().enumerate() {
            if i < NDADDR {
                dp.db[i] = b;
            } else {
                dp.ib[i - NDADDR] = b;
            }
        }
        dp
    }
}

#[derive(Debug, Default)]
pub struct DirTree {
    nodes: Vec<DirNode>,
    index: HashMap<Ino, usize>,
    /// Orden de recorrido (por bloque en disco tras sort_by_block).
    order: Vec<usize>,
}

impl DirTree {
    pub fn with_capacity(n: usize) -> Result<Self> {
        let mut nodes = Vec::new();
        nodes.try_reserve(n).map_err(|_| FsckError::NoMemory("inoinfo"))?;
        Ok(Self {
            nodes,
            ..Self::default()
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registra (o refresca) el directorio `ino`.
    pub fn insert(&mut self, ino: Ino, dp: &Dinode, bsize: i64) {
        let node = DirNode::new(ino, dp, bsize);
        match self.index.get(&ino) {
            Some(&i) => {
                let old = &mut self.nodes[i];
                old.isize = node.isize;
                old.blks = node.blks;
            }
            None => {
                self.index.insert(ino, self.nodes.len());
                self.order.push(self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    pub fn get(&self, ino: Ino) -> Option<&DirNode> {
        self.index.get(&ino).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, ino: Ino) -> Option<&mut DirNode> {
        match self.index.get(&ino) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    /// Directorios en el orden de recorrido.
    pub fn inos(&self) -> Vec<Ino> {
        self.order.iter().map(|&i| self.nodes[i].ino).collect()
    }

    pub fn sort_by_block(&mut self) {
        let nodes = &self.nodes;
        self.order
            .sort_by_key(|&i| nodes[i].blks.first().copied().unwrap_or(0));
    }

    /// Cuelga `child` de `parent` y registra el padre.
    pub fn link(&mut self, parent: Ino, child: Ino) {
        let (Some(&p), Some(&c)) = (self.index.get(&parent), self.index.get(&child)) else {
            return;
        };
        self.nodes[c].parent = parent;
        self.nodes[c].sibling = self.nodes[p].child;
        self.nodes[p].child = Some(c);
    }
}

impl<D: Device> Fsck<D> {
    /// Marca como encontrado `ino` y todo lo que cuelga de él. Recorre los
    /// enlaces hijo/hermano/padre hasta volver a `ino`, sin recursión; los
    /// subárboles ya encontrados se recorren igual. Un recorrido sano da a lo
    /// sumo 2n pasos, más que eso son enlaces cíclicos.
    pub fn propagate(&mut self, ino: Ino) {
        let Some(&start) = self.dirs.index.get(&ino) else {
            return;
        };
        let limit = 2 * self.dirs.nodes.len() + 2;
        let mut cur = start;
        let mut ascending = false;
        for _ in 0..limit {
            if !ascending {
                let n_ino = self.dirs.nodes[cur].ino;
                self.set_state(n_ino, InodeState::DirFound);
                if let Some(c) = self.dirs.nodes[cur].child {
                    cur = c;
                    continue;
                }
            }
            // Subárbol de `cur` terminado.
            if cur == start {
                return;
            }
            if let Some(s) = self.dirs.nodes[cur].sibling {
                cur = s;
                ascending = false;
            } else {
                let parent = self.dirs.nodes[cur].parent;
                match self.dirs.index.get(&parent) {
                    Some(&p) => cur = p,
                    None => return,
                }
                ascending = true;
            }
        }
        warn!(ino, "propagación interrumpida: enlaces de directorio cíclicos");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::config::FsckOptions;
    use crate::fsck::fsck_types::InodeStatus;
    use crate::fsck::mock::MemDevice;
    use crate::fsck::prompt::ScriptedOperator;

    /// Sesión sin disco con `n` inodos, todos directorios sin encontrar.
    fn session(n: usize) -> Fsck<MemDevice> {
        let mut f = Fsck::new(
            MemDevice::new(Vec::new()),
            FsckOptions::default(),
            Box::new(ScriptedOperator::new(true)),
        );
        let dir = InodeStatus {
            state: InodeState::Dir,
            ..InodeStatus::default()
        };
        f.inodes = vec![dir; n];
        f
    }

    fn add(f: &mut Fsck<MemDevice>, inos: impl IntoIterator<Item = Ino>) {
        for ino in inos {
            f.dirs.insert(ino, &dir(512, 0), 8192);
        }
    }

    fn dir(size: u64, first: Daddr) -> Dinode {
        let mut dp = Dinode {
            mode: IFDIR | 0o755,
            size,
            ..Dinode::default()
        };
        dp.db[0] = first;
        dp
    }

    #[test]
    fn keeps_only_used_pointers() {
        let mut t = DirTree::default();
        t.insert(5, &dir(512, 40), 8192);
        let n = t.get(5).unwrap();
        assert_eq!(n.blks, vec![40]);
        assert_eq!(n.parent, 0);
        assert_eq!(n.as_dinode().db[0], 40);
        t.insert(ROOTINO, &dir(0, 0), 8192);
        assert_eq!(t.get(ROOTINO).unwrap().parent, ROOTINO);
        assert!(t.get(ROOTINO).unwrap().blks.is_empty());
    }

    #[test]
    fn sorts_by_first_block() {
        let mut t = DirTree::default();
        t.insert(3, &dir(512, 90), 8192);
        t.insert(4, &dir(512, 10), 8192);
        t.insert(5, &dir(512, 50), 8192);
        t.sort_by_block();
        assert_eq!(t.inos(), vec![4, 5, 3]);
    }

    #[test]
    fn deep_chain_is_found_to_the_bottom() {
        let n: Ino = 10_000;
        let mut f = session(n as usize + 3);
        add(&mut f, ROOTINO..ROOTINO + n);
        for ino in ROOTINO..ROOTINO + n - 1 {
            f.dirs.link(ino, ino + 1);
        }
        f.propagate(ROOTINO);
        assert!((ROOTINO..ROOTINO + n).all(|i| f.state(i) == InodeState::DirFound));
    }

    #[test]
    fn every_sibling_and_grandchild_is_found() {
        let mut f = session(600);
        add(&mut f, ROOTINO..500);
        for ino in 3..250 {
            f.dirs.link(ROOTINO, ino);
            f.dirs.link(ino, ino + 247);
        }
        f.propagate(ROOTINO);
        assert!((ROOTINO..497).all(|i| f.state(i) == InodeState::DirFound));
        assert_eq!(f.state(497), InodeState::Dir);
    }

    #[test]
    fn already_found_subtree_does_not_hide_its_siblings() {
        let mut f = session(16);
        add(&mut f, ROOTINO..10);
        // 2 -> {3, 4}; 3 -> 5; 4 -> 6; 3 ya estaba encontrado.
        f.dirs.link(ROOTINO, 4);
        f.dirs.link(ROOTINO, 3);
        f.dirs.link(3, 5);
        f.dirs.link(4, 6);
        f.set_state(3, InodeState::DirFound);
        f.propagate(ROOTINO);
        for ino in 2..=6 {
            assert_eq!(f.state(ino), InodeState::DirFound, "inodo {ino}");
        }
        assert_eq!(f.state(7), InodeState::Dir);
    }

    #[test]
    fn cyclic_links_terminate() {
        let mut f = session(16);
        add(&mut f, 3..8);
        f.dirs.link(3, 4);
        f.dirs.link(4, 5);
        f.dirs.link(5, 3);
        // Enlazar dos veces deja un hermano que se apunta a sí mismo.
        f.dirs.link(6, 7);
        f.dirs.link(6, 7);
        f.propagate(3);
        f.propagate(6);
        for ino in 3..8 {
            assert_eq!(f.state(ino), InodeState::DirFound, "inodo {ino}");
        }
    }

    #[test]
    fn unknown_start_is_ignored() {
        let mut f = session(8);
        add(&mut f, [3]);
        f.propagate(5);
        assert_eq!(f.state(3), InodeState::Dir);
        assert_eq!(f.state(5), InodeState::Dir);
    }
}
