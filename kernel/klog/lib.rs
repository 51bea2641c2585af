//! Hypervisor logging (`klog`).
//!
//! Profile-aware logging macros shared by every crate in the workspace. The
//! crate has no dependencies so that leaf subsystems (IOMMU page-table
//! management, domain-ID allocation, ...) can log without pulling in a console
//! driver.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Boot banners, status messages |
//! | [`klog_force!`] | Active | No | Pre-panic diagnostics, critical errors |
//!
//! # Output Sink
//!
//! Formatted lines are handed to a single sink registered with
//! [`register_sink`] (the serial console on real hardware, a capture buffer in
//! tests). Until a sink is registered every line is discarded.
//!
//! # Hardening Profile Integration
//!
//! Filtering is **runtime** and derived from the active profile set through
//! [`set_profile`]:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.

#![no_std]

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe
/// ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness or isolation.
    Error = 4,
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level.  Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to DISABLED; the boot path must call [`set_profile`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`]. Fail-closed until [`set_profile`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profile selecting the log filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// No klog output.
    Secure = 0,
    /// Errors and warnings only.
    Balanced = 1,
    /// All levels.
    Performance = 2,
}

/// Set the klog filter from a profile.
///
/// Secure profile also suppresses [`klog_always!`].
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output.  Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Signature of an output sink.
///
/// The sink receives one complete line (without the trailing newline) and
/// must write it without interleaving with lines from other CPUs.
pub type KlogSink = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; null means "discard".
static SINK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Register the sink that receives every emitted line.
///
/// Replaces any previously registered sink.
pub fn register_sink(sink: KlogSink) {
    SINK.store(sink as *mut (), Ordering::Release);
}

/// Remove the registered sink; subsequent output is discarded.
pub fn unregister_sink() {
    SINK.store(ptr::null_mut(), Ordering::Release);
}

#[doc(hidden)]
#[inline]
pub fn _klog_print(args: fmt::Arguments<'_>) {
    let raw = SINK.load(Ordering::Acquire);
    if raw.is_null() {
        return;
    }
    // SAFETY: `register_sink` only stores valid `KlogSink` function pointers,
    // which have the same size and representation as `*mut ()`.
    let sink: KlogSink = unsafe { core::mem::transmute::<*mut (), KlogSink>(raw) };
    sink(args);
}

// ============================================================================
// Macros
// ============================================================================

/// Profile-gated output (boot banners, status messages).
///
/// Suppressed in [`KlogProfile::Secure`]. Use [`klog_force!`] for output that
/// must appear regardless of profile.
#[macro_export]
macro_rules! klog_always {
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
}

/// Unconditional output, never suppressed by any profile.
///
/// Reserved for diagnostics immediately preceding a panic or for hardware
/// errors that prevent the hypervisor from continuing.
#[macro_export]
macro_rules! klog_force {
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!($($arg)+));
    }};
}

/// Debug-only print, compiled out of release builds.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Profile-aware logging.
///
/// `Debug` and `Trace` are additionally compiled out in release builds.
///
/// # Examples
///
/// ```ignore
/// klog!(Warn, "d{}: identity map [{:#x},{:#x}) conflicts", id, base, end);
/// klog!(Debug, "CPU{}: {} queued page tables handed to CPU{}", dead, n, cpu);
/// ```
#[macro_export]
macro_rules! klog {
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!($($arg)+));
        }
    }};
}
