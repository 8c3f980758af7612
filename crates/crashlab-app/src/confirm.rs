//! Console confirmation
//!
//! Prints the crash box for a diagnosed fault and asks whether to save a
//! snapshot. Used when the gate runs with `confirm = "prompt"`.

use std::io::{self, BufRead, BufReader, Write};

use parking_lot::Mutex;

use crashlab_core::{BuildIdentity, DiagnosisReport, UserConfirmation};

/// Number of leading registers shown in the crash box
const SHOWN_REGISTERS: usize = 3;

/// Yes/no prompt on a text console
pub struct ConsolePrompt {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
    default_answer: bool,
}

impl ConsolePrompt {
    /// Prompt on stderr, reading the answer from stdin
    pub fn stdio(default_answer: bool) -> Self {
        Self::new(
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stderr()),
            default_answer,
        )
    }

    pub fn new(
        input: Box<dyn BufRead + Send>,
        output: Box<dyn Write + Send>,
        default_answer: bool,
    ) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            default_answer,
        }
    }

    fn render(&self, report: &DiagnosisReport<'_>, out: &mut dyn Write) -> io::Result<()> {
        let d = report.descriptor;
        writeln!(out)?;
        writeln!(out, "  ┌─── Crash Info ───────────────────────────────┐")?;
        writeln!(out, "  │ Code:      {}", d.code)?;
        writeln!(out, "  │ Address:   0x{:X}", d.instruction_address)?;
        writeln!(out, "  │ Thread:    {}", d.thread_id)?;
        writeln!(out, "  │ Category:  {}", report.category)?;
        writeln!(out, "  │ Diagnosis: {}", report.message)?;
        if let Some(hint) = report.hint {
            writeln!(out, "  │ Hint:      {}", hint)?;
        }
        for reg in d.registers.iter().take(SHOWN_REGISTERS) {
            writeln!(out, "  │ {:<9}  0x{:X}", reg.name.to_uppercase() + ":", reg.value)?;
        }
        if let Some(identity) = BuildIdentity::current() {
            writeln!(
                out,
                "  │ Build:     {} ({})",
                identity.revision(),
                identity.branch()
            )?;
        }
        writeln!(out, "  └──────────────────────────────────────────────┘")?;
        let choices = if self.default_answer { "[Y/n]" } else { "[y/N]" };
        write!(out, "  Save a crash dump? {} ", choices)?;
        out.flush()
    }

    fn read_answer(&self) -> bool {
        let mut line = String::new();
        match self.input.lock().read_line(&mut line) {
            Ok(0) => {
                log::debug!("No input for crash prompt, using default answer");
                self.default_answer
            }
            Ok(_) => parse_answer(&line).unwrap_or(self.default_answer),
            Err(e) => {
                log::warn!("Failed to read crash prompt answer: {}", e);
                self.default_answer
            }
        }
    }
}

impl UserConfirmation for ConsolePrompt {
    fn confirm(&self, report: &DiagnosisReport<'_>) -> bool {
        {
            let mut output = self.output.lock();
            if let Err(e) = self.render(report, &mut *output) {
                log::warn!("Failed to show crash prompt: {}", e);
                return self.default_answer;
            }
        }
        let answer = self.read_answer();
        if !answer {
            log::info!("User declined the crash dump");
        }
        answer
    }
}

/// Interpret a yes/no answer; `None` for an empty or unrecognized line
fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
