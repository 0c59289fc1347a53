//! Terminal rendering for command results. Everything here goes to stdout;
//! logs go to stderr.

use std::fmt::Write as _;

use sealward_core::bootstrap::{BootstrapOutcome, BootstrapState};
use sealward_core::credentials::BootstrapCredentials;
use sealward_core::pipeline::PodStatus;
use sealward_core::reconcile::ReconcileSummary;

// ── ANSI color helpers ───────────────────────────────────────────────

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";
const BG_RED: &str = "\x1b[41m";
const BG_GREEN: &str = "\x1b[42m";

const BANNER_SMALL: &str = "⟐ sealward";

fn header(icon: &str, title: &str) {
    println!();
    println!("  {BANNER_SMALL}");
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn seal_badge(sealed: bool) -> String {
    if sealed {
        format!("{BG_RED}{WHITE}{BOLD} SEALED {RESET}")
    } else {
        format!("{BG_GREEN}{WHITE}{BOLD} UNSEALED {RESET}")
    }
}

pub fn print_bootstrap(outcome: &BootstrapOutcome) {
    header("🔐", "Vault Bootstrap");
    kv_line("State", &outcome.state.to_string());
    kv_line(
        "Initialized now",
        if outcome.initialized_now { "yes" } else { "no" },
    );
    if let Some(path) = &outcome.credentials_path {
        kv_line("Credentials", &path.display().to_string());
    }
    if let Some(auto) = &outcome.auto_unseal {
        kv_line(
            "Auto-unseal",
            &format!("{} ({}/{})", auto.mechanism, auto.pod, auto.config_map),
        );
    }
    for report in &outcome.unsealed {
        let detail = if report.already_unsealed {
            "already unsealed".to_owned()
        } else {
            format!("{} keys submitted", report.submitted)
        };
        kv_line(&report.pod, &detail);
    }
    println!();

    match outcome.state {
        BootstrapState::AutoUnsealSkipped => {
            warning("auto-unseal is configured, manual unseal was skipped");
        }
        _ => success("Vault is initialized and unsealed"),
    }
    if outcome.initialized_now {
        warning("keep the credential cache safe, it holds the unseal keys and root token");
    }
}

/// Last-resort dump of credentials that could not be cached. Vault will not
/// return them again.
pub fn print_unsaved_credentials(credentials: &BootstrapCredentials) {
    header("🔑", "Unsaved Vault Credentials");
    warning("the credential cache could not be written, store these now");
    println!();
    for (i, key) in credentials.keys.iter().enumerate() {
        kv_line(&format!("Unseal key {}", i + 1), key);
    }
    kv_line("Root token", &credentials.token);
    println!();
}

pub fn print_summary(title: &str, summary: &ReconcileSummary) {
    header("⚙", title);
    for item in &summary.changed {
        println!("  {GREEN}+{RESET} {item}");
    }
    for item in &summary.unchanged {
        println!("  {DIM}= {item}{RESET}");
    }
    println!();
    if summary.is_noop() {
        success("nothing to change");
    } else {
        success(&format!("{} applied", summary.changed.len()));
    }
}

pub fn print_status(statuses: &[PodStatus]) {
    header("🔐", "Vault Status");
    for status in statuses {
        let name = format!("{}/{}", status.namespace, status.pod);
        match &status.seal {
            Some(seal) if !seal.initialized => {
                kv_line(&name, &format!("{RED}not initialized{RESET}"));
            }
            Some(seal) => {
                let mut line = seal_badge(seal.sealed);
                if seal.sealed && seal.progress > 0 {
                    let _ = write!(line, " {}/{}", seal.progress, seal.threshold);
                }
                kv_line(&name, &line);
            }
            None => kv_line(&name, &format!("{DIM}{}{RESET}", status.phase)),
        }
    }
    println!();
}
