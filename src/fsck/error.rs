// Errores del fsck. Los problemas locales (un inodo, una entrada) nunca
// llegan aquí: se reportan y se sigue. Esto es para lo que aborta la corrida.

use std::io;

use thiserror::Error;

use crate::dir::DirError;
use crate::fs::{Daddr, SuperblockError};

#[derive(Debug, Error)]
pub enum FsckError {
    #[error("error de E/S en el fragmento {blk}: {source}")]
    Io {
        blk: Daddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Superblock(#[from] SuperblockError),
    #[error(transparent)]
    Dir(#[from] DirError),
    #[error("sin memoria para la tabla {0}")]
    NoMemory(&'static str),
    #[error("{0}: UNEXPECTED INCONSISTENCY; RUN fsck MANUALLY.")]
    Unexpected(String),
    #[error("{0}")]
    Fatal(String),
    #[error("revisión abortada por el operador")]
    Aborted,
}

impl FsckError {
    /// Código de salida de fsck para una corrida abortada.
    pub fn exit_code(&self) -> i32 {
        8
    }

    pub(crate) fn io(blk: Daddr, source: io::Error) -> Self {
        FsckError::Io { blk, source }
    }
}

pub type Result<T, E = FsckError> = std::result::Result<T, E>;
