// Opciones de la corrida, a partir de la línea de comandos:
//   fsck.ffs [-p | -y | -n] [-f] [-c] [-d] [-b bloque] dispositivo

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use super::prompt::{FixedOperator, Operator, PreenOperator, TerminalOperator};

pub const USAGE: &str = "Uso: fsck.ffs [-p | -y | -n] [-f] [-c] [-d] [-b bloque] dispositivo";

/// Quién contesta las preguntas de reparación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerMode {
    #[default]
    Interactive,
    AssumeYes,
    AssumeNo,
    Preen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsckOptions {
    pub mode: AnswerMode,
    pub device: PathBuf,
    /// Superbloque alterno, en unidades de DEV_BSIZE (-b).
    pub alt_sblock: Option<i64>,
    /// Pasar grupos de cilindros estáticos al formato dinámico (-c).
    pub convert: bool,
    /// Revisar aunque el sistema esté marcado limpio (-f).
    pub force: bool,
    pub debug: bool,
    /// Forzar (o desactivar) el intercambio de namlen/tipo en directorios
    /// viejos. None: se decide por el formato de inodos.
    pub dir_swap: Option<bool>,
    pub cache_blocks: usize,
}

impl Default for FsckOptions {
    fn default() -> Self {
        Self {
            mode: AnswerMode::Interactive,
            device: PathBuf::new(),
            alt_sblock: None,
            convert: false,
            force: false,
            debug: false,
            dir_swap: None,
            cache_blocks: 512,
        }
    }
}

impl FsckOptions {
    /// Interpreta los argumentos (sin el nombre del programa).
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts = FsckOptions::default();
        let mut device = None;
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-p" => opts.set_mode(AnswerMode::Preen)?,
                "-y" => opts.set_mode(AnswerMode::AssumeYes)?,
                "-n" => opts.set_mode(AnswerMode::AssumeNo)?,
                "-f" => opts.force = true,
                "-c" => opts.convert = true,
                "-d" => opts.debug = true,
                "-b" => {
                    let v = args.next().context("-b necesita un número de bloque")?;
                    let blk: i64 = v
                        .parse()
                        .with_context(|| format!("número de bloque inválido: {v}"))?;
                    if blk <= 0 {
                        bail!("el superbloque alterno debe ser positivo: {blk}");
                    }
                    opts.alt_sblock = Some(blk);
                }
                s if s.starts_with('-') => bail!("opción desconocida {s}\n{USAGE}"),
                _ => {
                    if device.replace(PathBuf::from(&arg)).is_some() {
                        bail!("sobra el argumento {arg}\n{USAGE}");
                    }
                }
            }
        }

        opts.device = device.ok_or_else(|| anyhow!("{USAGE}"))?;
        Ok(opts)
    }

    fn set_mode(&mut self, mode: AnswerMode) -> Result<()> {
        if self.mode != AnswerMode::Interactive && self.mode != mode {
            bail!("-p, -y y -n son excluyentes");
        }
        self.mode = mode;
        Ok(())
    }

    pub fn preen(&self) -> bool {
        self.mode == AnswerMode::Preen
    }

    /// En -n el dispositivo se abre en solo lectura.
    pub fn readonly(&self) -> bool {
        self.mode == AnswerMode::AssumeNo
    }

    pub fn operator(&self) -> Box<dyn Operator> {
        match self.mode {
            AnswerMode::Interactive => Box::new(TerminalOperator::new()),
            AnswerMode::AssumeYes => Box::new(FixedOperator(true)),
            AnswerMode::AssumeNo => Box::new(FixedOperator(false)),
            AnswerMode::Preen => Box::new(PreenOperator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_device() {
        let o = FsckOptions::from_args(["-y", "-c", "-b", "32", "/dev/sd0a"]).unwrap();
        assert_eq!(o.mode, AnswerMode::AssumeYes);
        assert!(o.convert);
        assert_eq!(o.alt_sblock, Some(32));
        assert_eq!(o.device, PathBuf::from("/dev/sd0a"));
    }

    #[test]
    fn rejects_conflicting_modes() {
        assert!(FsckOptions::from_args(["-y", "-n", "img"]).is_err());
        assert!(FsckOptions::from_args(["-p", "-p", "img"]).is_ok());
    }

    #[test]
    fn requires_a_device() {
        assert!(FsckOptions::from_args(["-p"]).is_err());
        assert!(FsckOptions::from_args(["a", "b"]).is_err());
        assert!(FsckOptions::from_args(["-b", "x", "img"]).is_err());
    }
}
