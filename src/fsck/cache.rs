/*Caché de bloques del fsck. Todo lo que se lee del disco (bloques de inodos,
indirectos, grupos de cilindros, directorios) pasa por aquí; las
modificaciones quedan marcadas como sucias hasta flush(). El bloque de
directorio en uso queda fijado y nunca se desaloja mientras se recorre.*/

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::fs::{Daddr, DEV_BSIZE};

use super::error::{FsckError, Result};
use super::fsck_backend::Device;

#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub data: Vec<u8>,
    pub dirty: bool,
}

pub struct BlockCache<D: Device> {
    dev: D,
    fsize: u64,
    bufs: HashMap<Daddr, CachedBlock>,
    order: VecDeque<Daddr>,
    capacity: usize,
    pinned: Option<Daddr>,
    readonly: bool,
    written: usize,
}

impl<D: Device> BlockCache<D> {
    pub fn new(dev: D, capacity: usize) -> Self {
        let readonly = dev.is_readonly();
        Self {
            dev,
            fsize: DEV_BSIZE as u64,
            bufs: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(4),
            pinned: None,
            readonly,
            written: 0,
        }
    }

    pub fn set_fsize(&mut self, fsize: i64) {
        self.fsize = fsize as u64;
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly || self.dev.is_readonly();
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    /// Bloques escritos al dispositivo desde que se creó la caché.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn dev_len(&self) -> u64 {
        self.dev.len()
    }

    /// Lectura directa, sin pasar por la caché (superbloque y tabla de resúmenes).
    pub fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.dev
            .read_at(offset, buf)
            .map_err(|e| FsckError::io((offset / self.fsize) as Daddr, e))
    }

    pub fn write_raw(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        self.dev
            .write_at(offset, buf)
            .map_err(|e| FsckError::io((offset / self.fsize) as Daddr, e))?;
        self.written += 1;
        Ok(())
    }

    fn write_back(&mut self, blk: Daddr, data: &[u8]) -> Result<()> {
        trace!(blk, len = data.len(), "escribiendo bloque");
        self.write_raw(blk as u64 * self.fsize, data)
    }

    fn evict(&mut self) -> Result<()> {
        let mut spins = self.order.len();
        while self.bufs.len() >= self.capacity && spins > 0 {
            spins -= 1;
            let Some(victim) = self.order.pop_front() else { break };
            if Some(victim) == self.pinned {
                self.order.push_back(victim);
                continue;
            }
            if let Some(b) = self.bufs.remove(&victim) {
                if b.dirty {
                    self.write_back(victim, &b.data)?;
                }
            }
        }
        Ok(())
    }

    /// `blk` pasa a ser el usado más recientemente.
    fn touch(&mut self, blk: Daddr) {
        if let Some(i) = self.order.iter().rposition(|&b| b == blk) {
            self.order.remove(i);
        }
        self.order.push_back(blk);
    }

    fn load(&mut self, blk: Daddr, size: usize) -> Result<()> {
        if let Some(b) = self.bufs.get(&blk) {
            if b.data.len() == size {
                self.touch(blk);
                return Ok(());
            }
            // Mismo bloque pedido con otro tamaño: se vuelve a leer.
            if let Some(old) = self.bufs.remove(&blk) {
                if old.dirty {
                    self.write_back(blk, &old.data)?;
                }
            }
        }
        self.evict()?;
        let mut data = vec![0u8; size];
        self.dev
            .read_at(blk as u64 * self.fsize, &mut data)
            .map_err(|e| FsckError::io(blk, e))?;
        self.bufs.insert(blk, CachedBlock { data, dirty: false });
        self.touch(blk);
        Ok(())
    }

    pub fn get(&mut self, blk: Daddr, size: usize) -> Result<&mut CachedBlock> {
        self.load(blk, size)?;
        self.bufs
            .get_mut(&blk)
            .ok_or_else(|| FsckError::Fatal(format!("bloque {blk} perdido en la caché")))
    }

    /// Igual que get, pero el bloque queda fijado como el directorio en curso.
    pub fn get_dir(&mut self, blk: Daddr, size: usize) -> Result<&mut CachedBlock> {
        if self.pinned != Some(blk) {
            self.pinned = None;
        }
        self.load(blk, size)?;
        self.pinned = Some(blk);
        self.bufs
            .get_mut(&blk)
            .ok_or_else(|| FsckError::Fatal(format!("bloque {blk} perdido en la caché")))
    }

    /// Bloque recién asignado: su contenido viejo no importa.
    pub fn install(&mut self, blk: Daddr, data: Vec<u8>) -> Result<()> {
        if self.bufs.remove(&blk).is_none() {
            self.evict()?;
        }
        self.bufs.insert(blk, CachedBlock { data, dirty: true });
        self.touch(blk);
        Ok(())
    }

    pub fn mark_dirty(&mut self, blk: Daddr) {
        if let Some(b) = self.bufs.get_mut(&blk) {
            b.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.bufs.values().any(|b| b.dirty)
    }

    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<Daddr> = self
            .bufs
            .iter()
            .filter(|(_, b)| b.dirty)
            .map(|(blk, _)| *blk)
            .collect();
        dirty.sort_unstable();
        for blk in dirty {
            let data = match self.bufs.get_mut(&blk) {
                Some(b) => {
                    b.dirty = false;
                    std::mem::take(&mut b.data)
                }
                None => continue,
            };
            let res = self.write_back(blk, &data);
            if let Some(b) = self.bufs.get_mut(&blk) {
                b.data = data;
            }
            res?;
        }
        if !self.readonly {
            self.dev.sync().map_err(|e| FsckError::io(0, e))?;
        }
        debug!(written = self.written, "caché vaciada");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsck::mock::MemDevice;

    fn cache() -> BlockCache<MemDevice> {
        let mut c = BlockCache::new(MemDevice::new(vec![0u8; 64 * 1024]), 4);
        c.set_fsize(1024);
        c
    }

    #[test]
    fn dirty_blocks_reach_the_device_on_flush() {
        let mut c = cache();
        c.get(3, 1024).unwrap().data[0] = 0xAB;
        c.mark_dirty(3);
        assert_eq!(c.device().writes, 0);
        c.flush().unwrap();
        assert_eq!(c.device().data[3 * 1024], 0xAB);
        assert_eq!(c.device().writes, 1);
        c.flush().unwrap();
        assert_eq!(c.device().writes, 1);
    }

    #[test]
    fn eviction_writes_back_but_keeps_pinned() {
        let mut c = cache();
        c.get_dir(1, 1024).unwrap().data[0] = 1;
        c.mark_dirty(1);
        for blk in 2..10 {
            let b = c.get(blk, 1024).unwrap();
            b.data[0] = blk as u8;
            b.dirty = true;
        }
        assert_eq!(c.get_dir(1, 1024).unwrap().data[0], 1);
        assert!(c.device().writes > 0);
        assert_eq!(c.device().data[2 * 1024], 2);
    }

    #[test]
    fn recently_read_block_outlives_older_ones() {
        let mut c = cache();
        for blk in 1..=4 {
            let b = c.get(blk, 1024).unwrap();
            b.data[0] = blk as u8;
            b.dirty = true;
        }
        c.get(1, 1024).unwrap();
        c.install(2, vec![7u8; 1024]).unwrap();
        c.get(5, 1024).unwrap();
        // El menos usado era el 3.
        assert_eq!(c.device().writes, 1);
        assert_eq!(c.device().data[3 * 1024], 3);
        assert_eq!(c.device().data[1024], 0);
        assert_eq!(c.order.len(), c.bufs.len());
    }

    #[test]
    fn readonly_drops_writes() {
        let mut c = cache();
        c.set_readonly(true);
        c.get(2, 1024).unwrap().data[5] = 9;
        c.mark_dirty(2);
        c.flush().unwrap();
        assert_eq!(c.device().writes, 0);
        assert_eq!(c.device().data[2 * 1024 + 5], 0);
    }

    #[test]
    fn read_failure_is_reported_with_block() {
        let mut c = cache();
        c.device_mut().fail_reads_in(5 * 1024..6 * 1024);
        match c.get(5, 1024) {
            Err(FsckError::Io { blk, .. }) => assert_eq!(blk, 5),
            other => panic!("se esperaba error de E/S: {:?}", other.map(|_| ())),
        }
    }
}
