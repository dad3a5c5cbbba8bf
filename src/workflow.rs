//! Combination copy workflows
//!
//! Chains receive sessions into the higher-level operations the REPL
//! exposes: download a combi dump, re-address it, upload it back, and
//! finally commit the destination bank. Deliberately a simple saga: no
//! automatic retry, no rollback of items already copied.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use thiserror::Error;
use tracing::info;

use crate::device::SysexSink;
use crate::registry::CallbackRegistry;
use crate::session::{ProgressFn, ReceiveSession};
use crate::sysex::{SysexBuilder, FUNC_ACK, FUNC_COMBI_DUMP};

/// Scratch buffer size for a combi parameter dump; generously above the
/// largest dump the M3 produces.
pub const DUMP_BUFFER_SIZE: usize = 64 * 1024;

/// Byte offset of the bank field inside a captured dump frame.
pub const DEST_BANK_INDEX: usize = 6;
/// Byte offset of the slot number inside a captured dump frame.
pub const DEST_NUM_INDEX: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid bank (expected e.g. U-A or I-C)")]
pub struct ParseBankError;

/// A combination bank address: internal (`I-A`..`I-G`) or user
/// (`U-A`..`U-G`). The wire encoding sets bit 0x40 for user banks and puts
/// the bank letter in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bank(u8);

impl Bank {
    pub const USER_FLAG: u8 = 0x40;

    pub fn from_code(code: u8) -> Self {
        Bank(code)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER_FLAG != 0
    }

    pub fn letter(self) -> char {
        (b'A' + (self.0 & !Self::USER_FLAG)) as char
    }
}

impl Default for Bank {
    fn default() -> Self {
        Bank(0) // I-A
    }
}

impl FromStr for Bank {
    type Err = ParseBankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || bytes[1] != b'-' {
            return Err(ParseBankError);
        }
        let mut code = match bytes[0] {
            b'u' | b'U' => Self::USER_FLAG,
            b'i' | b'I' => 0,
            _ => return Err(ParseBankError),
        };
        code |= match bytes[2] {
            letter @ b'A'..=b'G' => letter - b'A',
            letter @ b'a'..=b'g' => letter - b'a',
            _ => return Err(ParseBankError),
        };
        Ok(Bank(code))
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            if self.is_user() { 'U' } else { 'I' },
            self.letter()
        )
    }
}

/// Operator command driving one step of a sequential copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCommand {
    /// Copy the next item, optionally overriding the source slot first.
    Copy { src_num: Option<u8> },
    /// End the run and commit the destination bank to non-volatile memory.
    Stop,
    /// End the run without committing.
    Cancel,
}

/// What a sequential step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    Copied,
    Committed,
    Cancelled,
}

/// Copies combinations between banks, one download/upload pair per item.
///
/// Source and destination counters advance past an item only after both of
/// its exchanges finished; a failed item leaves them where they were so the
/// operator can retry or give up.
pub struct PatchCopier {
    sysex: SysexBuilder,
    session: ReceiveSession,
    timeout: Duration,
    pub src_bank: Bank,
    pub src_num: u8,
    pub dest_bank: Bank,
    pub dest_num: u8,
}

impl PatchCopier {
    pub fn new(device_id: u8, registry: Arc<CallbackRegistry>, timeout: Duration) -> Self {
        Self {
            sysex: SysexBuilder::new(device_id),
            session: ReceiveSession::new(registry),
            timeout,
            src_bank: Bank::default(),
            src_num: 0,
            dest_bank: Bank::default(),
            dest_num: 0,
        }
    }

    /// Progress callback forwarded to every exchange.
    pub fn set_progress(&self, progress: ProgressFn) {
        self.session.set_progress(progress);
    }

    fn exchange(
        &mut self,
        sink: &mut dyn SysexSink,
        command: &[u8],
        expected_function: u8,
        capacity: usize,
    ) -> Result<usize> {
        self.session
            .begin(sink, command, expected_function, capacity)?;
        Ok(self.session.wait(self.timeout)?)
    }

    /// Put the keyboard into the given mode (see [`crate::sysex::MODE_COMBI`]).
    pub fn mode_change(&mut self, sink: &mut dyn SysexSink, mode: u8) -> Result<()> {
        let command = self.sysex.mode_change(mode);
        self.exchange(sink, &command, FUNC_ACK, 0)?;
        Ok(())
    }

    /// Copy one combination from (src_bank, src_num) to (dest_bank,
    /// dest_num), advancing both slot counters on success.
    pub fn copy_next(&mut self, sink: &mut dyn SysexSink) -> Result<()> {
        info!(
            "Copying from {}:{:03} to {}:{:03}",
            self.src_bank, self.src_num, self.dest_bank, self.dest_num
        );

        let request = self.sysex.combi_dump_request(self.src_bank.code(), self.src_num);
        self.exchange(sink, &request, FUNC_COMBI_DUMP, DUMP_BUFFER_SIZE)?;

        let mut dump = self.session.take_payload();
        if dump.len() <= DEST_NUM_INDEX {
            bail!("dump reply too short to re-address ({} bytes)", dump.len());
        }
        dump[DEST_BANK_INDEX] = self.dest_bank.code();
        dump[DEST_NUM_INDEX] = self.dest_num;

        // Sending a parameter dump at the device writes it into the
        // addressed slot; the device answers with a plain ack.
        self.exchange(sink, &dump, FUNC_ACK, 0)?;

        self.src_num = self.src_num.wrapping_add(1);
        self.dest_num = self.dest_num.wrapping_add(1);
        Ok(())
    }

    /// Store the edit-buffer combination to (dest_bank, dest_num).
    pub fn store_combination(&mut self, sink: &mut dyn SysexSink) -> Result<()> {
        let command = self
            .sysex
            .store_combination(self.dest_bank.code(), self.dest_num);
        self.exchange(sink, &command, FUNC_ACK, 0)?;
        Ok(())
    }

    /// Commit the destination bank to non-volatile memory.
    pub fn commit_bank(&mut self, sink: &mut dyn SysexSink) -> Result<()> {
        info!("Committing bank {}", self.dest_bank);
        let command = self.sysex.store_combination_bank(self.dest_bank.code());
        self.exchange(sink, &command, FUNC_ACK, 0)?;
        Ok(())
    }

    /// Single transition of the sequential copy loop. Errors bubble up
    /// without advancing anything; the caller decides whether to keep the
    /// run alive.
    pub fn step(&mut self, sink: &mut dyn SysexSink, command: SeqCommand) -> Result<SeqOutcome> {
        match command {
            SeqCommand::Copy { src_num } => {
                if let Some(num) = src_num {
                    self.src_num = num;
                }
                self.copy_next(sink)?;
                Ok(SeqOutcome::Copied)
            }
            SeqCommand::Stop => {
                self.commit_bank(sink)?;
                Ok(SeqOutcome::Committed)
            }
            SeqCommand::Cancel => Ok(SeqOutcome::Cancelled),
        }
    }
}
