/*Define la interfaz para el dispositivo que revisa el fsck.
Todo el acceso al disco pasa por este trait: lecturas y escrituras en
posiciones absolutas (en bytes). Existen dos implementaciones:
FileDevice (un archivo o dispositivo real) y MemDevice (mock.rs, para pruebas)
*/

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

pub trait Device {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    /// Tamaño del dispositivo en bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Abierto sin permiso de escritura (modo -n).
    fn is_readonly(&self) -> bool {
        false
    }
}

pub struct FileDevice {
    file: File,
    len: u64,
    readonly: bool,
}

impl FileDevice {
    pub fn open(path: &Path, readonly: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(!readonly).open(path)?;
        let len = file.metadata()?.len();
        debug!(?path, len, readonly, "dispositivo abierto");
        Ok(Self { file, len, readonly })
    }
}

impl Device for FileDevice {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.readonly {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "dispositivo abierto en solo lectura",
            ));
        }
        self.file.write_all_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.file.sync_all()
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }
}
