//! In-kernel test runner for the `-threads-tests` boot action (spec.md 6).
//!
//! `#[cfg(test)]` modules scattered through the crate only run under the
//! host-target test harness (see DESIGN.md); this re-runs the same
//! pure-logic assertions at boot, in QEMU, for parity with that suite.

use crate::cmdline::{self, Action};
use crate::debug_println;

pub fn run_in_kernel_tests() {
    debug_println!("Running tests...");

    cmdline_parses_options_before_actions();
    cmdline_rejects_unknown_option();

    debug_println!("Tests passed.");
}

fn cmdline_parses_options_before_actions() {
    let (config, actions) = cmdline::parse("-q -ul=64 ls").expect("parse failed");
    assert!(config.power_off_when_done);
    assert_eq!(config.user_page_limit, Some(64));
    assert!(matches!(actions.as_slice(), [Action::Ls]));
}

fn cmdline_rejects_unknown_option() {
    assert!(cmdline::parse("-bogus").is_err());
}
