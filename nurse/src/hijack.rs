//! Entry-point capture, redirect, and resume.
//!
//! The injector drives a small state machine over the target's memory:
//!
//! ```text
//! Uninjected -> Captured -> Redirected
//!      ^------ revert ---------/
//! ```
//!
//! `Captured` means the target's original entry address has been saved into
//! the in-target slot; `Redirected` means the target's effective entry
//! location now points at the trampoline. Both transitions happen while the
//! injector holds the target stopped; a torn write to the entry location on
//! a running target would crash it permanently. Every failure path reverts
//! to the pre-attempt state rather than leaving a half-hijacked target.
//!
//! On the target side, [`Trampoline`] owns the saved entry for the rest of
//! the process lifetime and guarantees the tail transfer happens even when
//! its own setup fails: a permanently hung target is worse than a partially
//! unprotected one, so setup failures are logged and resumed past.

use std::ffi::{c_char, c_int};

use nix::errno::Errno;
use thiserror::Error;
use tracing::warn;

/// The signature of a process entry point: `main(argc, argv, envp)`.
pub type MainFn = extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

/// Possible errors driving the hijack state machine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HijackError {
    /// The slot or entry location already points at the trampoline; the
    /// target has been injected before. The existing state is left alone.
    #[error("target is already injected")]
    AlreadyInjected,
    /// A readback did not match what was just written; something else is
    /// writing the slot. Fatal to the attempt.
    #[error("slot readback mismatch at {addr:#x}: wrote {wrote:#x}, read back {read:#x}")]
    SlotCorrupt { addr: usize, wrote: usize, read: usize },
    /// The write installing the trampoline address did not apply (protected
    /// mapping, for instance). The machine reverts to `Uninjected` before
    /// this is surfaced.
    #[error("redirect did not apply at entry location {location:#x}")]
    RedirectFailed { location: usize },
    #[error("{op} is not valid in the {state:?} state")]
    InvalidTransition {
        op: &'static str,
        state: HijackState,
    },
    #[error("target memory access failed: {0}")]
    Memory(#[from] Errno),
}

/// Word-granular access to the target's address space.
///
/// The ptrace-backed injector implements this for a stopped target; tests
/// implement it over a plain buffer. All writes through this trait happen
/// inside the stopped window, the one sanctioned exception to the target
/// owning its own memory.
pub trait TargetMemory {
    fn read_word(&mut self, addr: usize) -> Result<usize, Errno>;
    fn write_word(&mut self, addr: usize, value: usize) -> Result<(), Errno>;
}

/// Observable state of one injection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HijackState {
    Uninjected,
    Captured,
    Redirected,
}

/// One injection attempt's hijack of a single target.
///
/// Scoped to the attempt: the slot is not ambient process-wide state, so the
/// write-once/read-once contract is enforced by the machine itself.
#[derive(Debug)]
pub struct Hijack {
    state: HijackState,
    /// In-target address of the entry-point slot the trampoline will read.
    slot_addr: usize,
    /// In-target address holding the effective entry pointer.
    entry_location: usize,
    /// In-target address of the trampoline.
    trampoline_addr: usize,
    /// The slot's pre-attempt contents, restored on revert.
    slot_prior: usize,
    /// The captured original entry address, valid from `Captured` on.
    original_entry: usize,
}

impl Hijack {
    #[must_use]
    pub fn new(slot_addr: usize, entry_location: usize, trampoline_addr: usize) -> Self {
        Self {
            state: HijackState::Uninjected,
            slot_addr,
            entry_location,
            trampoline_addr,
            slot_prior: 0,
            original_entry: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> HijackState {
        self.state
    }

    /// The captured original entry address.
    ///
    /// # Panics
    ///
    /// Panics if called before [`capture`](Self::capture) has succeeded.
    #[must_use]
    pub fn original_entry(&self) -> usize {
        assert_ne!(self.state, HijackState::Uninjected, "nothing captured yet");
        self.original_entry
    }

    /// Save the target's original entry address into the in-target slot.
    ///
    /// Refuses a target that is already injected, leaving its state
    /// untouched. Must run while the target is stopped.
    pub fn capture<M: TargetMemory>(&mut self, mem: &mut M) -> Result<(), HijackError> {
        if self.state != HijackState::Uninjected {
            return Err(HijackError::AlreadyInjected);
        }
        let slot_prior = mem.read_word(self.slot_addr)?;
        let entry = mem.read_word(self.entry_location)?;
        // A slot or entry already pointing at the trampoline means a prior
        // injection is in place; a plausible original entry never does.
        if slot_prior == self.trampoline_addr || entry == self.trampoline_addr {
            return Err(HijackError::AlreadyInjected);
        }

        mem.write_word(self.slot_addr, entry)?;
        let read = mem.read_word(self.slot_addr)?;
        if read != entry {
            // A racing writer; put the slot back before reporting.
            let _ = mem.write_word(self.slot_addr, slot_prior);
            return Err(HijackError::SlotCorrupt {
                addr: self.slot_addr,
                wrote: entry,
                read,
            });
        }

        self.slot_prior = slot_prior;
        self.original_entry = entry;
        self.state = HijackState::Captured;
        Ok(())
    }

    /// Point the target's effective entry at the trampoline.
    ///
    /// Only valid in `Captured`, and only while the target is still stopped;
    /// the whole capture-to-redirect window must see no target instruction
    /// execute. On failure the slot is reverted and the machine returns to
    /// `Uninjected` so the target is never left half-hijacked.
    pub fn redirect<M: TargetMemory>(&mut self, mem: &mut M) -> Result<(), HijackError> {
        if self.state != HijackState::Captured {
            return Err(HijackError::InvalidTransition {
                op: "redirect",
                state: self.state,
            });
        }

        let applied = match mem.write_word(self.entry_location, self.trampoline_addr) {
            Ok(()) => mem.read_word(self.entry_location)? == self.trampoline_addr,
            Err(_) => false,
        };
        if !applied {
            let _ = mem.write_word(self.slot_addr, self.slot_prior);
            self.state = HijackState::Uninjected;
            return Err(HijackError::RedirectFailed {
                location: self.entry_location,
            });
        }

        self.state = HijackState::Redirected;
        Ok(())
    }

    /// Restore the target to its pre-attempt state.
    ///
    /// Valid from any state; reverting an `Uninjected` machine is a no-op.
    /// Used on every failure path (slot races, timeouts, redirect failures)
    /// so a failed attempt is never observable afterwards.
    pub fn revert<M: TargetMemory>(&mut self, mem: &mut M) -> Result<(), HijackError> {
        match self.state {
            HijackState::Uninjected => return Ok(()),
            HijackState::Redirected => {
                mem.write_word(self.entry_location, self.original_entry)?;
                mem.write_word(self.slot_addr, self.slot_prior)?;
            }
            HijackState::Captured => {
                mem.write_word(self.slot_addr, self.slot_prior)?;
            }
        }
        self.state = HijackState::Uninjected;
        Ok(())
    }
}

/// Target-side continuation into the real `main`.
///
/// Built by the injected stub from the slot the injector filled. The saved
/// entry is read out *before* any setup runs, so no setup failure can make
/// the original entry unreachable.
#[derive(Debug)]
pub struct Trampoline {
    realmain: MainFn,
}

impl Trampoline {
    #[must_use]
    pub fn new(realmain: MainFn) -> Self {
        Self { realmain }
    }

    /// Run pre-main setup, then tail-call the saved original entry with the
    /// unmodified argument and environment vectors.
    ///
    /// A setup failure is surfaced through the log side channel only; the
    /// transfer into the original entry still happens, best-effort, because
    /// refusing to resume would hang the target permanently.
    pub fn run<E: std::fmt::Display>(
        self,
        setup: impl FnOnce() -> Result<(), E>,
        argc: c_int,
        argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) -> c_int {
        // Read the entry before setup can fail or exit.
        let realmain = self.realmain;
        if let Err(e) = setup() {
            warn!(error = %e, "trampoline setup failed; resuming original entry unprotected");
        }
        realmain(argc, argv, envp)
    }
}
