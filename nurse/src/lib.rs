//! Core mechanisms for hijacking the entry point of a running process.
//!
//! This crate carries the three pieces of contract shared between an injector
//! process and the stub it places inside a target:
//!
//! - [`elf`]: native-word-width dispatch over ELF structure layouts, so the
//!   injector parses the target's image with the correctly sized types.
//! - [`channel`]: a named, fixed-size (16-byte) shared-memory channel used
//!   exactly once per injection to hand a single pointer-sized value across
//!   the process boundary.
//! - [`hijack`]: the state machine that captures a target's original entry
//!   point, redirects execution through a trampoline, and guarantees the
//!   original entry stays reachable even when trampoline setup fails.
//!
//! None of this is a security boundary on its own; the mechanisms here exist
//! to exercise and test syscall filters living in a collaborating process.
//! The filter policy itself, and whatever protocol runs after the handoff
//! completes, are out of scope for this crate.

pub mod channel;
pub mod elf;
pub mod hijack;

pub use channel::{CHANNEL_MODE, CHANNEL_NAME, CHANNEL_SIZE, ChannelError, HandoffChannel};
pub use elf::{ElfClass, WidthError, WordWidth};
pub use hijack::{Hijack, HijackError, HijackState, MainFn, TargetMemory, Trampoline};
