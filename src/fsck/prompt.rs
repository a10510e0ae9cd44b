/*Protocolo de preguntas del fsck. Cada reparación se propone como una
pregunta (etiqueta + acción, por ejemplo "UNREF FILE" / "CLEAR") y un
operador decide. En modo preen nadie contesta: cada pregunta trae su
política (reparar, saltar o abortar la corrida)*/

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use colored::*;

use super::error::{FsckError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreenPolicy {
    Fix,
    Skip,
    Abort,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub tag: &'static str,
    pub detail: String,
    pub action: &'static str,
    pub preen: PreenPolicy,
}

impl Question {
    /// Por defecto una pregunta no tiene respuesta automática en preen.
    pub fn new(tag: &'static str, action: &'static str) -> Self {
        Self {
            tag,
            detail: String::new(),
            action,
            preen: PreenPolicy::Abort,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn preen(mut self, policy: PreenPolicy) -> Self {
        self.preen = policy;
        self
    }

    pub fn line(&self) -> String {
        if self.detail.is_empty() {
            self.tag.to_string()
        } else {
            format!("{} {}", self.tag, self.detail)
        }
    }
}

/// Lo que se imprime en preen cuando la reparación se hace sola.
pub fn preen_note(action: &str) -> &'static str {
    match action {
        "SALVAGE" => "(SALVAGED)",
        "CLEAR" => "(CLEARED)",
        "ADJUST" => "(ADJUSTED)",
        "RECONNECT" => "(RECONNECTED)",
        "CORRECT" => "(CORRECTED)",
        "EXPAND" => "(EXPANDED)",
        "CREATE" => "(CREATED)",
        "REMOVE" => "(REMOVED)",
        "CONTINUE" => "(CONTINUING)",
        _ => "(FIXED)",
    }
}

pub trait Operator {
    fn ask(&mut self, q: &Question) -> Result<bool>;
}

/// Contesta siempre lo mismo (-y / -n).
pub struct FixedOperator(pub bool);

impl Operator for FixedOperator {
    fn ask(&mut self, q: &Question) -> Result<bool> {
        let ans = if self.0 { "yes".green() } else { "no".red() };
        println!("{}\n{}? {}\n", q.line(), q.action, ans);
        Ok(self.0)
    }
}

pub struct PreenOperator;

impl Operator for PreenOperator {
    fn ask(&mut self, q: &Question) -> Result<bool> {
        match q.preen {
            PreenPolicy::Fix => {
                println!("{} {}", q.line(), preen_note(q.action));
                Ok(true)
            }
            PreenPolicy::Skip => {
                println!("{} (IGNORED)", q.line());
                Ok(false)
            }
            PreenPolicy::Abort => Err(FsckError::Unexpected(q.line())),
        }
    }
}

pub struct TerminalOperator {
    tty: bool,
}

impl TerminalOperator {
    pub fn new() -> Self {
        // SAFETY: isatty sólo consulta el descriptor 0.
        let tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
        Self { tty }
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for TerminalOperator {
    fn ask(&mut self, q: &Question) -> Result<bool> {
        if !self.tty {
            return Err(FsckError::Fatal(format!(
                "{}: no se puede preguntar, la entrada no es una terminal",
                q.line()
            )));
        }
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            print!("{}\n{}? [yn] ", q.line(), q.action.bold());
            io::stdout().flush().ok();
            line.clear();
            let n = stdin
                .lock()
                .read_line(&mut line)
                .map_err(|e| FsckError::Fatal(format!("no se pudo leer la respuesta: {e}")))?;
            if n == 0 {
                return Err(FsckError::Aborted);
            }
            match line.trim() {
                "y" | "Y" | "yes" => return Ok(true),
                "n" | "N" | "no" => return Ok(false),
                _ => continue,
            }
        }
    }
}

/// Respuestas predefinidas, en orden; cuando se acaban usa `default`.
/// Guarda cada pregunta recibida.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    pub answers: VecDeque<bool>,
    pub default: bool,
    pub asked: Vec<(&'static str, &'static str)>,
}

impl ScriptedOperator {
    pub fn new(default: bool) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    pub fn with_answers(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            default,
            asked: Vec::new(),
        }
    }
}

impl Operator for ScriptedOperator {
    fn ask(&mut self, q: &Question) -> Result<bool> {
        self.asked.push((q.tag, q.action));
        Ok(self.answers.pop_front().unwrap_or(self.default))
    }
}
