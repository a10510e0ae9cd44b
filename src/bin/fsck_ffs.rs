use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};
use colored::*;
use tracing_subscriber::EnvFilter;

use ffsck::fsck::config::FsckOptions;
use ffsck::fsck::fsck_backend::FileDevice;
use ffsck::fsck::fsck_types::FsckReport;
use ffsck::fsck::run_fsck;

fn main() -> ExitCode {
    let opts = match FsckOptions::from_args(env::args().skip(1)) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("{} {e:#}", "fsck.ffs:".red().bold());
            return ExitCode::from(8);
        }
    };
    init_logging(opts.debug);

    match check(opts) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", "fsck.ffs:".red().bold());
            ExitCode::from(8)
        }
    }
}

/// FSCK_LOG manda; si no está, -d sube el nivel a debug.
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("FSCK_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn check(opts: FsckOptions) -> Result<u8> {
    let name = opts.device.display().to_string();
    let dev = FileDevice::open(&opts.device, opts.readonly())
        .with_context(|| format!("no se pudo abrir {name}"))?;
    let operator = opts.operator();
    let preen = opts.preen();

    match run_fsck(dev, opts, operator) {
        Ok((rep, _)) => {
            if preen {
                print_preen(&name, &rep);
            } else {
                print_report(&name, &rep);
            }
            Ok(rep.exit_code() as u8)
        }
        Err(e) => {
            eprintln!("{}: {}", name, e.to_string().red().bold());
            Ok(e.exit_code() as u8)
        }
    }
}

/// En preen sólo una línea por sistema de archivos.
fn print_preen(name: &str, rep: &FsckReport) {
    if rep.skipped {
        println!("{name}: clean");
        return;
    }
    println!(
        "{name}: {} files, {} used, free: {} frags, {} blocks",
        rep.files,
        rep.used_frags,
        rep.free_frags,
        rep.free_blocks
    );
    if rep.modified {
        println!("{name}: {}", "***** FILE SYSTEM WAS MODIFIED *****".yellow().bold());
    }
}

fn print_report(name: &str, rep: &FsckReport) {
    println!("\n{}", format!(" FFS FILESYSTEM CHECK: {name} ").on_blue().bold());
    println!("{}", "──────────────────────────────────────────".blue());

    println!("\n{}", "Bloques".bold().underline());
    if rep.blocks_ok {
        println!("  {} Bloques OK", "✓".green());
    } else {
        println!("  {} Errores en bloques", "✗".red());
    }

    println!("\n{}", "Inodos".bold().underline());
    if rep.inodes_ok {
        println!("  {} Inodos OK", "✓".green());
    } else {
        println!("  {} Errores en inodos", "✗".red());
    }

    println!("\n{}", "Errores detectados".bold().underline());
    if rep.errors.is_empty() {
        println!("  {} No se encontraron errores", "✓".green());
    } else {
        for err in &rep.errors {
            println!("  {} {}", "•".red(), err.red());
        }
    }

    println!("\n{}", "Resumen".bold().underline());
    println!(
        "  {} archivos, {} fragmentos usados, libres: {} frags, {} bloques",
        rep.files,
        rep.used_frags,
        rep.free_frags,
        rep.free_blocks
    );
    if rep.marked_clean {
        println!("  {} marcado limpio", "✓".green());
    }
    if rep.modified {
        println!("  {}", "***** FILE SYSTEM WAS MODIFIED *****".yellow().bold());
    }

    if rep.unresolved == 0 {
        println!("{} {} corregidos.\n", "✓ OK".green().bold(), rep.fixed.to_string().yellow());
    } else {
        println!(
            "{} {} sin resolver.\n",
            "✗ FSCK completado con errores:".red().bold(),
            rep.unresolved.to_string().yellow()
        );
    }
}
