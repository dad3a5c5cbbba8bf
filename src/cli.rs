//! Command-line interface and REPL
//!
//! The interactive prompt driving copy workflows. Command parsing is kept
//! pure so it can be tested without a terminal or a device.

use anyhow::Result;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Write};

use crate::device::{discovery::PortInfo, SysexSink};
use crate::sysex::MODE_COMBI;
use crate::workflow::{Bank, PatchCopier, SeqCommand};

/// Parsed top-level command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// `mode <target>`; only "combi" is implemented.
    Mode(String),
    CopySrc(Bank),
    CopyDest(Bank),
    /// `copyseq [startnum]` enters the sequential copy prompt.
    CopySeq(Option<u8>),
    /// `copynext [num]` copies a single item.
    CopyNext(Option<u8>),
    Quit,
    Empty,
    Unknown(String),
    /// Recognized command with unusable arguments; payload is the hint to
    /// print.
    Invalid(&'static str),
}

/// Parse one line from the main prompt.
pub fn parse_command(line: &str) -> Command {
    let mut words = line.split_whitespace();
    let Some(keyword) = words.next() else {
        return Command::Empty;
    };
    match keyword.to_lowercase().as_str() {
        "help" => Command::Help,
        "mode" => match words.next() {
            Some(target) => Command::Mode(target.to_lowercase()),
            None => Command::Invalid("Usage: mode combi"),
        },
        "copysrc" => match words.next().and_then(|word| word.parse().ok()) {
            Some(bank) => Command::CopySrc(bank),
            None => Command::Invalid("Invalid input. e.g., copysrc U-A"),
        },
        "copydest" => match words.next().and_then(|word| word.parse().ok()) {
            Some(bank) => Command::CopyDest(bank),
            None => Command::Invalid("Invalid input. e.g., copydest U-A"),
        },
        "copyseq" => Command::CopySeq(words.next().and_then(|word| word.parse().ok())),
        "copynext" => Command::CopyNext(words.next().and_then(|word| word.parse().ok())),
        "exit" | "quit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Parse one line from the sequential-copy prompt. An empty line copies the
/// next source slot; a number overrides the source slot first.
pub fn parse_seq_command(line: &str) -> SeqCommand {
    let word = line.trim();
    if word.eq_ignore_ascii_case("cancel") {
        return SeqCommand::Cancel;
    }
    if ["done", "stop", "quit", "exit"]
        .iter()
        .any(|stop| word.eq_ignore_ascii_case(stop))
    {
        return SeqCommand::Stop;
    }
    SeqCommand::Copy {
        src_num: word.parse().ok(),
    }
}

/// Run the interactive prompt until the operator quits.
pub fn run_repl(copier: &mut PatchCopier, sink: &mut dyn SysexSink) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("{}", "m3combi - Korg M3 combination copy tool".bold());
    println!("Type 'help' for commands, 'quit' to exit.\n");

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                match parse_command(&line) {
                    Command::Quit => break,
                    command => execute(command, copier, sink, &mut rl)?,
                }
            }
            // Ctrl-C or Ctrl-D at the main prompt behaves like 'quit'.
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn execute(
    command: Command,
    copier: &mut PatchCopier,
    sink: &mut dyn SysexSink,
    rl: &mut DefaultEditor,
) -> Result<()> {
    match command {
        Command::Help => print_help(),
        Command::Mode(target) if target == "combi" => {
            match copier.mode_change(sink, MODE_COMBI) {
                Ok(()) => println!("{}", "OK".green()),
                Err(err) => println!("{}", err.to_string().red()),
            }
        }
        Command::Mode(target) => println!("mode {}: not implemented", target),
        Command::CopySrc(bank) => copier.src_bank = bank,
        Command::CopyDest(bank) => {
            copier.dest_bank = bank;
            copier.dest_num = 0;
        }
        Command::CopySeq(start) => {
            if let Some(num) = start {
                copier.dest_num = num;
            }
            run_sequential(rl, copier, sink)?;
        }
        Command::CopyNext(src_num) => copy_one(copier, sink, src_num),
        Command::Unknown(word) => {
            println!("Unknown command '{}'. Type 'help' for commands.", word)
        }
        Command::Invalid(hint) => eprintln!("{}", hint),
        Command::Quit | Command::Empty => {}
    }
    Ok(())
}

/// Inner prompt of `copyseq`: one line per copied item until the operator
/// commits or cancels. A failed item stays at the same destination slot so
/// it can be retried.
fn run_sequential(
    rl: &mut DefaultEditor,
    copier: &mut PatchCopier,
    sink: &mut dyn SysexSink,
) -> Result<()> {
    println!(
        "Sequential copy into {}; 'done' commits the bank, 'cancel' abandons.",
        copier.dest_bank
    );

    loop {
        let prompt = format!("{:03} < ", copier.dest_num);
        let command = match rl.readline(&prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                parse_seq_command(&line)
            }
            // EOF commits like 'done'; Ctrl-C abandons like 'cancel'.
            Err(ReadlineError::Eof) => SeqCommand::Stop,
            Err(ReadlineError::Interrupted) => SeqCommand::Cancel,
            Err(err) => return Err(err.into()),
        };

        match command {
            SeqCommand::Copy { src_num } => copy_one(copier, sink, src_num),
            SeqCommand::Stop => {
                print!("Saving");
                let _ = io::stdout().flush();
                match copier.step(sink, SeqCommand::Stop) {
                    Ok(_) => println!(" {}", "OK".green()),
                    Err(err) => println!(" {}", err.to_string().red()),
                }
                break;
            }
            SeqCommand::Cancel => break,
        }
    }
    Ok(())
}

fn copy_one(copier: &mut PatchCopier, sink: &mut dyn SysexSink, src_num: Option<u8>) {
    let from_num = src_num.unwrap_or(copier.src_num);
    println!(
        "Copying from {}:{:03} to {}:{:03}",
        copier.src_bank, from_num, copier.dest_bank, copier.dest_num
    );
    print!("Receiving");
    let _ = io::stdout().flush();

    match copier.step(sink, SeqCommand::Copy { src_num }) {
        Ok(_) => println!(" {}", "OK".green()),
        Err(err) => println!(" {}", err.to_string().red()),
    }
}

fn print_help() {
    println!("mode      Set the current mode of the keyboard.");
    println!("    mode combi       Enter Combi Play mode");
    println!();
    println!("copysrc   Set the source bank for future copy operations.");
    println!("    copysrc (I-A..I-G | U-A..U-G)");
    println!();
    println!("copydest  Set the destination bank for future copy operations.");
    println!("    copydest (I-A..I-G | U-A..U-G)");
    println!();
    println!("copyseq   Start a sequential copy into consecutive destination patches.");
    println!("          Enters a prompt expecting source patch numbers, or copying");
    println!("          incrementally from the source bank. Copies only exist in the");
    println!("          keyboard's temporary memory until committed with 'done'/'stop'.");
    println!("          'cancel' stops without committing to non-volatile memory.");
    println!("    copyseq [startnum]  Optionally start at the given destination patch.");
    println!();
    println!("copynext [num]  Copy a single patch, optionally from the given source.");
    println!();
    println!("exit|quit Exits the program");
}

/// Interactive fallback when a configured port is missing: list what exists
/// and ask for a number (1-based; anything else aborts).
pub fn choose_port(kind: &str, ports: &[PortInfo]) -> Option<usize> {
    println!("{} {} devices:", ports.len(), kind);
    for (index, port) in ports.iter().enumerate() {
        println!("  [{}]: {}", index + 1, port.name);
    }
    print!("Enter a device number: ");
    io::stdout().flush().ok()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line).ok()?;
    let id: usize = line.trim().parse().ok()?;
    if id == 0 || id > ports.len() {
        return None;
    }
    Some(id - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_case_insensitively() {
        assert_eq!(parse_command("HELP"), Command::Help);
        assert_eq!(parse_command("Quit"), Command::Quit);
        assert_eq!(
            parse_command("COPYSRC u-a"),
            Command::CopySrc("U-A".parse().unwrap())
        );
    }

    #[test]
    fn mode_requires_a_target() {
        assert_eq!(parse_command("mode combi"), Command::Mode("combi".into()));
        assert_eq!(parse_command("mode PROG"), Command::Mode("prog".into()));
        assert!(matches!(parse_command("mode"), Command::Invalid(_)));
    }

    #[test]
    fn bad_bank_arguments_are_invalid() {
        assert!(matches!(parse_command("copysrc"), Command::Invalid(_)));
        assert!(matches!(parse_command("copysrc X-A"), Command::Invalid(_)));
        assert!(matches!(parse_command("copydest U-H"), Command::Invalid(_)));
    }

    #[test]
    fn copyseq_takes_an_optional_start() {
        assert_eq!(parse_command("copyseq"), Command::CopySeq(None));
        assert_eq!(parse_command("copyseq 12"), Command::CopySeq(Some(12)));
        // Unparseable numbers are ignored rather than rejected.
        assert_eq!(parse_command("copyseq abc"), Command::CopySeq(None));
    }

    #[test]
    fn blank_and_unknown_lines() {
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(
            parse_command("frobnicate"),
            Command::Unknown("frobnicate".into())
        );
    }

    #[test]
    fn seq_prompt_grammar() {
        assert_eq!(parse_seq_command("cancel"), SeqCommand::Cancel);
        assert_eq!(parse_seq_command("DONE"), SeqCommand::Stop);
        assert_eq!(parse_seq_command("stop"), SeqCommand::Stop);
        assert_eq!(parse_seq_command("quit"), SeqCommand::Stop);
        assert_eq!(parse_seq_command(""), SeqCommand::Copy { src_num: None });
        assert_eq!(
            parse_seq_command("17"),
            SeqCommand::Copy { src_num: Some(17) }
        );
    }
}
