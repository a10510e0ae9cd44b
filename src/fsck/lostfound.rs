// Reconexión de huérfanos en lost+found. Si el directorio no existe se crea
// bajo la raíz; si la entrada apunta a algo que no es directorio se reasigna.

use tracing::info;

use crate::fs::{Ino, ROOTINO};
use crate::inode::{IFDIR, IFMT};

use super::error::Result;
use super::fsck::Fsck;
use super::fsck_backend::Device;
use super::fsck_types::InodeState;
use super::prompt::{PreenPolicy, Question};

const LFNAME: &[u8] = b"lost+found";
const LFMODE: u16 = 0o700;

/// Nombre con el que un huérfano queda en lost+found: "#" y el número de
/// inodo con tantos dígitos como el mayor inodo posible.
pub fn lftempname(maxino: u64, ino: Ino) -> String {
    let width = maxino.to_string().len();
    format!("#{ino:0width$}")
}

impl<D: Device> Fsck<D> {
    /// Engancha `orphan` en lost+found. `former_parent` es lo que decía su
    /// ".." (None si no se sabe).
    pub(crate) fn reconnect_orphan(&mut self, orphan: Ino, former_parent: Option<Ino>) -> Result<bool> {
        let dp = self.ginode(orphan)?;
        let lostdir = dp.mode & IFMT == IFDIR;
        let tag = if lostdir { "UNREF DIR" } else { "UNREF FILE" };
        let desc = Self::inode_desc(orphan, &dp);
        if self.opts.preen() && dp.size == 0 {
            self.pwarn(tag, desc);
            return Ok(false);
        }
        if !self.ask(Question::new(tag, "RECONNECT").detail(desc).preen(PreenPolicy::Fix))? {
            return Ok(false);
        }

        if self.lost_found == 0 {
            self.lost_found = self.find_or_create_lost_found()?;
            if self.lost_found == 0 {
                self.pfatal("SORRY. CANNOT CREATE lost+found DIRECTORY", "")?;
                self.unfixable();
                return Ok(false);
            }
        }

        let lfdp = self.ginode(self.lost_found)?;
        if lfdp.mode & IFMT != IFDIR {
            self.pfatal("lost+found IS NOT A DIRECTORY", format!("I={}", self.lost_found))?;
            if !self.ask(Question::new("lost+found IS NOT A DIRECTORY", "REALLOCATE"))? {
                return Ok(false);
            }
            let old = self.lost_found;
            let Some(lf) = self.alloc_dir(ROOTINO, 0, LFMODE)? else {
                self.pfatal("SORRY. CANNOT CREATE lost+found DIRECTORY", "")?;
                self.unfixable();
                return Ok(false);
            };
            if !self.change_entry_owner(ROOTINO, LFNAME, lf)? {
                self.pfatal("SORRY. CANNOT CREATE lost+found DIRECTORY", "")?;
                self.unfixable();
                return Ok(false);
            }
            self.lost_found = lf;
            // La entrada de la raíz ya no apunta al viejo: una referencia menos.
            let lcnt = self.status(old).links + 1;
            self.adjust_links(old, lcnt)?;
            if let Some(st) = self.inodes.get_mut(old as usize) {
                st.links = 0;
            }
        }

        let lf = self.lost_found;
        if self.state(lf) != InodeState::DirFound {
            self.pfatal("SORRY. NO lost+found DIRECTORY", format!("I={lf}"))?;
            self.unfixable();
            return Ok(false);
        }
        let name = lftempname(self.maxino, orphan);
        if !self.insert_entry(lf, orphan, name.as_bytes())? {
            self.pfatal("SORRY. NO SPACE IN lost+found DIRECTORY", "")?;
            self.unfixable();
            return Ok(false);
        }
        self.add_links(orphan, -1);

        if lostdir {
            if !self.change_entry_owner(orphan, b"..", lf)? && former_parent.is_some() {
                self.insert_entry(orphan, lf, b"..")?;
            }
            let mut lfdp = self.ginode(lf)?;
            lfdp.nlink += 1;
            self.put_inode(lf, &lfdp)?;
            self.add_links(lf, 1);
            let was = match former_parent {
                Some(p) => format!("PARENT WAS I={p}"),
                None => String::new(),
            };
            self.pwarn("DIR CONNECTED", format!("I={orphan} {was}").trim_end().to_string());
            // El padre contó el ".." del huérfano sin que hubiera entrada.
            if let Some(p) = former_parent.filter(|&p| p >= ROOTINO && u64::from(p) < self.maxino) {
                self.add_links(p, 1);
            }
        }
        info!(orphan, name = %name, "reconectado en lost+found");
        Ok(true)
    }

    fn find_or_create_lost_found(&mut self) -> Result<Ino> {
        if let Some(lf) = self.find_entry(ROOTINO, LFNAME)? {
            return Ok(lf);
        }
        let q = Question::new("NO lost+found DIRECTORY", "CREATE").preen(PreenPolicy::Fix);
        if !self.ask(q)? {
            return Ok(0);
        }
        let Some(lf) = self.alloc_dir(ROOTINO, 0, LFMODE)? else {
            return Ok(0);
        };
        if self.insert_entry(ROOTINO, lf, LFNAME)? {
            Ok(lf)
        } else {
            self.free_dir(lf, ROOTINO)?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::config::FsckOptions;
    use crate::fsck::mock::{MemDevice, TestImage};
    use crate::fsck::prompt::ScriptedOperator;
    use crate::inode::{Dinode, IFREG};
    use crate::mkfs::{MkfsParams, LOSTFOUNDINO};

    fn orphan_file(t: &mut TestImage, ino: Ino) {
        let dp = Dinode {
            mode: IFREG | 0o644,
            nlink: 1,
            size: 10,
            blocks: 2,
            db: {
                let mut db = [0; crate::fs::NDADDR];
                db[0] = t.sb.cgdmin(0) + 24;
                db
            },
            ..Dinode::default()
        };
        t.put_inode(ino, &dp);
    }

    /// Arranque y fase 1, con la raíz y lost+found ya alcanzados.
    fn checked(t: TestImage) -> Fsck<MemDevice> {
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(true)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        f.set_state(ROOTINO, InodeState::DirFound);
        f.set_state(LOSTFOUNDINO, InodeState::DirFound);
        f
    }

    #[test]
    fn tempname_is_padded_to_maxino() {
        assert_eq!(lftempname(512, 7), "#007");
        assert_eq!(lftempname(99, 42), "#42");
        assert_eq!(lftempname(100_000, 12345), "#012345");
    }

    #[test]
    fn orphan_file_lands_in_lost_found() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        orphan_file(&mut t, 7);
        let mut f = checked(t);
        assert_eq!(f.status(7).links, 1);
        assert!(f.reconnect_orphan(7, None).unwrap());
        assert_eq!(f.status(7).links, 0);
        assert_eq!(f.find_entry(LOSTFOUNDINO, b"#007").unwrap(), Some(7));
        assert_eq!(f.lost_found, LOSTFOUNDINO);
        assert!(f.report.has_tag("UNREF FILE"));
    }

    #[test]
    fn orphan_dir_points_dotdot_at_lost_found() {
        let t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let mut f = checked(t);
        f.set_state(ROOTINO, InodeState::Dir);
        let d = f.alloc_dir(ROOTINO, 0, 0o755).unwrap().unwrap();
        f.set_state(ROOTINO, InodeState::DirFound);
        let root_links = f.status(ROOTINO).links;
        let lf_links = f.status(LOSTFOUNDINO).links;
        let lf_nlink = f.ginode(LOSTFOUNDINO).unwrap().nlink;

        assert!(f.reconnect_orphan(d, Some(ROOTINO)).unwrap());
        assert_eq!(f.find_entry(d, b"..").unwrap(), Some(LOSTFOUNDINO));
        assert_eq!(f.find_entry(LOSTFOUNDINO, lftempname(f.maxino, d).as_bytes()).unwrap(), Some(d));
        assert_eq!(f.ginode(LOSTFOUNDINO).unwrap().nlink, lf_nlink + 1);
        assert_eq!(f.status(LOSTFOUNDINO).links, lf_links + 1);
        assert_eq!(f.status(ROOTINO).links, root_links + 1);
        assert_eq!(f.status(d).links, 1);
        assert!(f.report.has_tag("DIR CONNECTED"));
    }

    #[test]
    fn missing_lost_found_is_created() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        let rootblk = t.inode(ROOTINO).db[0];
        // La entrada "lost+found" de la raíz queda vacía.
        t.frag_mut(rootblk)[24..28].fill(0);
        orphan_file(&mut t, 7);
        let mut f = checked(t);
        assert!(f.reconnect_orphan(7, None).unwrap());
        let lf = f.find_entry(ROOTINO, b"lost+found").unwrap().unwrap();
        assert_ne!(lf, LOSTFOUNDINO);
        assert_eq!(f.state(lf), InodeState::DirFound);
        assert_eq!(f.find_entry(lf, b"#007").unwrap(), Some(7));
        assert!(f.report.has_tag("NO lost+found DIRECTORY"));
    }

    #[test]
    fn declined_reconnect_changes_nothing() {
        let mut t = TestImage::new(&MkfsParams::ufs2()).unwrap();
        orphan_file(&mut t, 7);
        let mut f = Fsck::new(t.device(), FsckOptions::default(), Box::new(ScriptedOperator::new(false)));
        assert!(f.setup().unwrap());
        f.pass1().unwrap();
        assert!(!f.reconnect_orphan(7, None).unwrap());
        assert_eq!(f.status(7).links, 1);
        assert_eq!(f.report.unresolved, 1);
    }
}
