use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};

use ffsck::cg::CgFormat;
use ffsck::fs::UfsVersion;
use ffsck::mkfs::{build_image, MkfsParams};

const USAGE: &str = "Uso: mkfs.ffs [-O 1|2] [-s] [-g grupos] imagen";

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let mut p = MkfsParams::default();
    let mut out = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-O" => {
                let v = args.next().context("-O necesita 1 o 2")?;
                p.version = match v.as_str() {
                    "1" => UfsVersion::Ufs1,
                    "2" => UfsVersion::Ufs2,
                    _ => bail!("versión desconocida {v}\n{USAGE}"),
                };
            }
            // Grupos estáticos (4.2BSD), sólo en UFS1.
            "-s" => p.cg_format = CgFormat::Static,
            "-g" => {
                let v = args.next().context("-g necesita un número de grupos")?;
                p.ncg = v.parse().with_context(|| format!("número de grupos inválido: {v}"))?;
                if p.ncg < 1 {
                    bail!("hace falta al menos un grupo");
                }
            }
            s if s.starts_with('-') => bail!("opción desconocida {s}\n{USAGE}"),
            _ => {
                if out.replace(PathBuf::from(&arg)).is_some() {
                    bail!("sobra el argumento {arg}\n{USAGE}");
                }
            }
        }
    }
    let out = out.ok_or_else(|| anyhow!("{USAGE}"))?;

    if p.version == UfsVersion::Ufs1 {
        p.contigsumsize = 0;
    }
    if p.cg_format == CgFormat::Static && p.version != UfsVersion::Ufs1 {
        bail!("-s sólo tiene sentido con -O 1");
    }

    let img = build_image(&p)?;
    fs::write(&out, &img).with_context(|| format!("No se pudo escribir la imagen {:?}", out))?;

    println!(
        "mkfs.ffs: {:?} creado con {} grupos de {} fragmentos de {} bytes, {} inodos por grupo.",
        out, p.ncg, p.fpg, p.fsize, p.ipg
    );
    Ok(())
}
