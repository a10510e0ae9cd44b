// Fase 3: conectividad. Todo directorio que la fase 2 no alcanzó desde la
// raíz se engancha en lost+found, empezando por el más alto de su cadena.

use tracing::{debug, info};

use crate::fs::ROOTINO;

use super::error::Result;
use super::fsck::{Fsck, Phase};
use super::fsck_backend::Device;
use super::fsck_types::InodeState;

impl<D: Device> Fsck<D> {
    pub fn pass3(&mut self) -> Result<()> {
        self.phase(Phase::Connectivity);
        let inos = self.dirs.inos();
        let mut reconnected = 0u32;
        for &ino in inos.iter().rev() {
            let state = self.state(ino);
            if ino == ROOTINO || state == InodeState::DirFound || state == InodeState::DirClear {
                continue;
            }
            // Sube hasta el primer antepasado que no tenga padre conocido.
            let mut orphan = ino;
            let mut limit = self.dirs.len();
            loop {
                let Some(parent) = self.dirs.get(orphan).map(|n| n.parent) else { break };
                if parent == 0 || self.state(parent) != InodeState::Dir || limit == 0 {
                    break;
                }
                orphan = parent;
                limit -= 1;
            }
            if limit == 0 {
                debug!(ino, "ciclo de directorios");
            }
            let dotdot = self.dirs.get(orphan).map_or(0, |n| n.dotdot);
            if self.reconnect_orphan(orphan, Some(dotdot))? {
                // El ".." del huérfano ya cuenta como referencia a lost+found.
                let lf = self.lost_found;
                self.add_links(lf, -1);
                if let Some(n) = self.dirs.get_mut(orphan) {
                    n.dotdot = lf;
                }
                self.dirs.link(lf, orphan);
                reconnected += 1;
            }
            // Conectado o no, su subárbol no se vuelve a tratar.
            self.propagate(orphan);
        }
        info!(reconectados = reconnected, "fase 3 terminada");
        Ok(())
    }
}
