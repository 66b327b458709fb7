//! Inject an interception trampoline into a running process.
//!
//! The driver here owns the whole lifecycle of one injection attempt:
//! verify the target's word width, attach and hold it stopped, establish
//! the shared handoff channel, capture the original entry point into the
//! in-target slot, redirect the effective entry through the trampoline,
//! publish the original entry over the channel, and detach. Any misstep
//! rolls the target back to its pre-attempt state and removes a channel
//! this attempt created; a failed attempt must never be observable
//! afterwards. The caller sees a single success-or-failure outcome.
//!
//! Loading the trampoline code itself into the target, and everything that
//! happens after the handoff completes, belong to collaborating components;
//! this driver is handed the relevant in-target addresses.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info};

use nurse::channel::{CHANNEL_NAME, ChannelError, HandoffChannel};
use nurse::elf::{WidthError, WordWidth, entry_point_any};
use nurse::hijack::{Hijack, HijackError, TargetMemory};

pub mod ptrace;

use ptrace::{TraceError, Tracee};

/// Hijack the entry point of a running process through a trampoline
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct CliArgs {
    /// The process to inject into
    #[arg(value_name = "PID")]
    pub pid: i32,
    /// In-target address of the entry-point slot the trampoline reads
    #[arg(long = "slot", value_name = "ADDR", value_parser = parse_addr)]
    pub slot_addr: usize,
    /// In-target address holding the effective entry pointer
    #[arg(long = "entry-location", value_name = "ADDR", value_parser = parse_addr)]
    pub entry_location: usize,
    /// In-target address of the installed trampoline
    #[arg(long = "trampoline", value_name = "ADDR", value_parser = parse_addr)]
    pub trampoline_addr: usize,
    /// Name of the shared handoff segment
    #[arg(long = "channel", value_name = "NAME", default_value = CHANNEL_NAME)]
    pub channel_name: String,
    /// How long to wait for the target to reach the stopped state, in
    /// milliseconds
    #[arg(long = "timeout", value_name = "MS", default_value_t = 1000)]
    pub timeout_ms: u64,
    /// Increase verbosity (pass multiple times to increase)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse an in-target address, `0x`-prefixed or decimal.
fn parse_addr(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

/// Possible errors for one injection attempt, by the taxonomy the caller
/// needs: setup problems, races, and timeouts are separate so a caller can
/// decide whether retrying against a fresh target makes sense.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InjectError {
    #[error("no such target process: {0}")]
    NoSuchTarget(i32),
    #[error("target image is {target}-bit but this injector is {host}-bit")]
    WidthMismatch { target: u32, host: u32 },
    #[error("failed to parse target image: {0}")]
    Image(#[from] WidthError),
    #[error("cannot read image of pid {pid}: {source}")]
    ImageRead {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    /// The target never reached the stopped state; nothing was written.
    #[error("timed out waiting for the target to stop")]
    Timeout,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Hijack(#[from] HijackError),
    #[error("tracing the target failed: {0}")]
    Trace(TraceError),
}

impl From<TraceError> for InjectError {
    fn from(e: TraceError) -> Self {
        match e {
            TraceError::Timeout { .. } => InjectError::Timeout,
            TraceError::NoSuchProcess(pid) => InjectError::NoSuchTarget(pid.as_raw()),
            other => InjectError::Trace(other),
        }
    }
}

/// In-target addresses and channel identity for one attempt.
#[derive(Clone, Debug)]
pub struct InjectOptions {
    pub slot_addr: usize,
    pub entry_location: usize,
    pub trampoline_addr: usize,
    pub channel_name: String,
    pub timeout: Duration,
}

impl InjectOptions {
    fn from_args(args: &CliArgs) -> Self {
        Self {
            slot_addr: args.slot_addr,
            entry_location: args.entry_location,
            trampoline_addr: args.trampoline_addr,
            channel_name: args.channel_name.clone(),
            timeout: Duration::from_millis(args.timeout_ms),
        }
    }
}

/// What a successful attempt handed off.
#[derive(Clone, Debug)]
pub struct InjectionReport {
    pub original_entry: usize,
    pub trampoline_addr: usize,
    pub channel_name: String,
}

/// Drive capture, channel publication, and redirect over an already-stopped
/// target's memory.
///
/// Everything before `Redirected` is invisible to the target on failure: the
/// hijack machine reverts its own writes, and a channel created by this
/// attempt is destroyed. Exposed for the driver and for scenario tests that
/// substitute the target's memory.
pub fn inject_stopped<M: TargetMemory>(
    mem: &mut M,
    opts: &InjectOptions,
) -> Result<InjectionReport, InjectError> {
    let mut channel = HandoffChannel::create_or_open(&opts.channel_name)?;
    let created_channel = channel.is_creator();

    let mut hijack = Hijack::new(opts.slot_addr, opts.entry_location, opts.trampoline_addr);
    let result = (|| {
        hijack.capture(mem)?;
        debug!(entry = format_args!("{:#x}", hijack.original_entry()), "entry captured");
        channel.write_value(hijack.original_entry() as u64)?;
        hijack.redirect(mem)?;
        Ok(InjectionReport {
            original_entry: hijack.original_entry(),
            trampoline_addr: opts.trampoline_addr,
            channel_name: opts.channel_name.clone(),
        })
    })();

    if result.is_err() {
        // Roll back whatever partial state exists; the revert is best-effort
        // on top of an already-failing attempt.
        let _ = hijack.revert(mem);
        drop(channel);
        if created_channel {
            let _ = HandoffChannel::destroy(&opts.channel_name);
        }
    }
    result
}

/// Run one complete injection attempt against a live process.
pub fn inject(pid: Pid, opts: &InjectOptions) -> Result<InjectionReport, InjectError> {
    verify_target_width(pid)?;

    let mut tracee = Tracee::attach(pid, opts.timeout)?;
    let report = inject_stopped(&mut tracee, opts)?;
    tracee.detach().map_err(InjectError::from)?;

    info!(
        %pid,
        entry = format_args!("{:#x}", report.original_entry),
        trampoline = format_args!("{:#x}", report.trampoline_addr),
        "entry point hijacked"
    );
    Ok(report)
}

/// Refuse a target whose image width differs from ours; ELF structure
/// layouts are never mixed across widths within one attempt.
fn verify_target_width(pid: Pid) -> Result<(), InjectError> {
    let exe = PathBuf::from(format!("/proc/{pid}/exe"));
    let image = std::fs::read(&exe).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InjectError::NoSuchTarget(pid.as_raw()),
        _ => InjectError::ImageRead {
            pid: pid.as_raw(),
            source: e,
        },
    })?;
    let (target, entry) = entry_point_any(&image)?;
    let host = WordWidth::host();
    if target != host {
        return Err(InjectError::WidthMismatch {
            target: target.bits(),
            host: host.bits(),
        });
    }
    debug!(
        image_entry = format_args!("{entry:#x}"),
        width = target.bits(),
        "target image verified"
    );
    Ok(())
}

/// CLI entry point: one attempt, one reported outcome. Intermediate
/// state-machine states are never exposed, only the error taxonomy.
pub fn run(args: &CliArgs) -> anyhow::Result<()> {
    let opts = InjectOptions::from_args(args);
    let report = inject(Pid::from_raw(args.pid), &opts)
        .with_context(|| format!("injection into pid {} failed", args.pid))?;
    println!(
        "hijacked pid {}: original entry {:#x} published on {}",
        args.pid, report.original_entry, report.channel_name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_parse_in_hex_and_decimal() {
        assert_eq!(parse_addr("0x7fff0000").unwrap(), 0x7fff_0000);
        assert_eq!(parse_addr("0X10").unwrap(), 0x10);
        assert_eq!(parse_addr("4096").unwrap(), 4096);
        assert!(parse_addr("0xzz").is_err());
        assert!(parse_addr("").is_err());
    }

    #[test]
    fn timeouts_stay_distinct_from_setup_errors() {
        let timed_out = TraceError::Timeout {
            pid: Pid::from_raw(1234),
            timeout: Duration::from_millis(5),
        };
        assert!(matches!(InjectError::from(timed_out), InjectError::Timeout));

        let gone = TraceError::NoSuchProcess(Pid::from_raw(1234));
        assert!(matches!(
            InjectError::from(gone),
            InjectError::NoSuchTarget(1234)
        ));
    }
}
