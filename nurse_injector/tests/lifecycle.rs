//! Scenario tests for the injection driver: the full handoff against a
//! simulated target, and rollback behavior on every failure path.

use std::collections::HashMap;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;

use nurse::channel::HandoffChannel;
use nurse::hijack::TargetMemory;
use nurse_injector::{InjectError, InjectOptions, inject, inject_stopped};

const SLOT: usize = 0x6000_1000;
const ENTRY_LOC: usize = 0x6000_2000;
const TRAMP: usize = 0x7fff_0000;
const REAL_ENTRY: usize = 0x40_1040;

/// A simulated stopped target: word-addressed memory plus optional
/// write-protection on the entry location.
struct SimTarget {
    words: HashMap<usize, usize>,
    entry_readonly: bool,
}

impl SimTarget {
    fn fresh() -> Self {
        let mut words = HashMap::new();
        words.insert(SLOT, 0);
        words.insert(ENTRY_LOC, REAL_ENTRY);
        Self {
            words,
            entry_readonly: false,
        }
    }
}

impl TargetMemory for SimTarget {
    fn read_word(&mut self, addr: usize) -> Result<usize, Errno> {
        self.words.get(&addr).copied().ok_or(Errno::EFAULT)
    }

    fn write_word(&mut self, addr: usize, value: usize) -> Result<(), Errno> {
        if !self.words.contains_key(&addr) {
            return Err(Errno::EFAULT);
        }
        if addr == ENTRY_LOC && self.entry_readonly {
            return Err(Errno::EFAULT);
        }
        self.words.insert(addr, value);
        Ok(())
    }
}

fn opts(channel_name: &str) -> InjectOptions {
    InjectOptions {
        slot_addr: SLOT,
        entry_location: ENTRY_LOC,
        trampoline_addr: TRAMP,
        channel_name: channel_name.to_owned(),
        timeout: Duration::from_millis(200),
    }
}

fn unique_channel(tag: &str) -> String {
    format!("/nurse-lifecycle-{tag}-{}", std::process::id())
}

fn channel_exists(name: &str) -> bool {
    match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => {
            drop(fd);
            true
        }
        Err(Errno::ENOENT) => false,
        Err(e) => panic!("unexpected shm_open error: {e}"),
    }
}

#[test]
fn full_handoff_publishes_the_original_entry() {
    let name = unique_channel("handoff");
    let mut target = SimTarget::fresh();

    let report = inject_stopped(&mut target, &opts(&name)).unwrap();
    assert_eq!(report.original_entry, REAL_ENTRY);

    // The target's slot holds its own entry; the effective entry is the
    // trampoline.
    assert_eq!(target.words[&SLOT], REAL_ENTRY);
    assert_eq!(target.words[&ENTRY_LOC], TRAMP);

    // A second, independent handle observes the published value.
    let reader = HandoffChannel::create_or_open(&name).unwrap();
    assert!(!reader.is_creator());
    assert_eq!(reader.read_value(), REAL_ENTRY as u64);

    HandoffChannel::destroy(&name).unwrap();
}

#[test]
fn redirect_failure_rolls_back_target_and_channel() {
    let name = unique_channel("rollback");
    let mut target = SimTarget::fresh();
    target.entry_readonly = true;

    let err = inject_stopped(&mut target, &opts(&name)).unwrap_err();
    assert!(matches!(
        err,
        InjectError::Hijack(nurse::hijack::HijackError::RedirectFailed { .. })
    ));

    // Pre-attempt state is fully restored and the channel no longer exists.
    assert_eq!(target.words[&SLOT], 0);
    assert_eq!(target.words[&ENTRY_LOC], REAL_ENTRY);
    assert!(!channel_exists(&name));
}

#[test]
fn capture_failure_destroys_only_a_channel_this_attempt_created() {
    let name = unique_channel("preexisting");
    // Channel established by "the other side" before the attempt.
    let other_side = HandoffChannel::create_or_open(&name).unwrap();
    assert!(other_side.is_creator());

    // Unmapped addresses make capture fail immediately.
    let mut target = SimTarget {
        words: HashMap::new(),
        entry_readonly: false,
    };
    let err = inject_stopped(&mut target, &opts(&name)).unwrap_err();
    assert!(matches!(err, InjectError::Hijack(_)));

    // The pre-existing channel survives a failed attempt that merely opened
    // it.
    assert!(channel_exists(&name));
    HandoffChannel::destroy(&name).unwrap();
}

#[test]
fn already_injected_target_is_refused_unchanged() {
    let name = unique_channel("twice");
    let mut target = SimTarget::fresh();

    inject_stopped(&mut target, &opts(&name)).unwrap();
    let err = inject_stopped(&mut target, &opts(&name)).unwrap_err();
    assert!(matches!(
        err,
        InjectError::Hijack(nurse::hijack::HijackError::AlreadyInjected)
    ));

    // First injection's state is untouched by the refused second attempt.
    assert_eq!(target.words[&SLOT], REAL_ENTRY);
    assert_eq!(target.words[&ENTRY_LOC], TRAMP);

    HandoffChannel::destroy(&name).unwrap();
}

#[test]
fn missing_target_is_a_setup_error() {
    // Above the default pid_max, so the pid cannot exist.
    let pid = nix::unistd::Pid::from_raw(4_194_000 + (std::process::id() % 300) as i32);
    let name = unique_channel("missing");
    let err = inject(pid, &opts(&name)).unwrap_err();
    assert!(matches!(err, InjectError::NoSuchTarget(_)));
    // Nothing was set up, so nothing should linger.
    assert!(!channel_exists(&name));
}
