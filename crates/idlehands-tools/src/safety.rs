// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Command and path safety screening.
//!
//! This is not a sandbox — it catches the common footgun patterns an LLM
//! might emit before they reach the shell.  Decision order for commands:
//!
//! 1. Forbidden patterns → never run, under any mode or flag.
//! 2. Cautious patterns → require confirmation (or yolo / no_confirm).
//! 3. Everything else → ok.

use std::path::Path;

/// Screening verdict.  `Forbidden` is not bypassable by any mode or flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Ok,
    Cautious { reason: String },
    Forbidden { reason: String },
}

impl SafetyVerdict {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, SafetyVerdict::Forbidden { .. })
    }
}

/// `(substring_pattern, reason)` pairs matched against the lowercased,
/// trimmed command.  First match wins.
const FORBIDDEN: &[(&str, &str)] = &[
    ("rm -rf /", "recursive forced removal from the filesystem root"),
    ("rm -rf /*", "recursive forced removal of all root children"),
    ("rm -rf ~", "recursive forced removal of the home directory"),
    (":(){ :|:& };:", "fork bomb"),
    ("| sh", "piping fetched content into a shell"),
    ("| bash", "piping fetched content into a shell"),
    ("|sh", "piping fetched content into a shell"),
    ("|bash", "piping fetched content into a shell"),
    ("dd if=", "raw block-device I/O"),
    ("mkfs", "filesystem creation wipes existing data"),
    ("> /dev/sd", "writes directly to a block device"),
    ("chmod 777 /", "world-writable root filesystem"),
    ("chown -r /", "recursive chown from root"),
    ("kill -9 1", "kills PID 1"),
    ("kill -9 -1", "SIGKILL to every process"),
    ("> /etc/", "overwrites a file under /etc"),
    (">> /etc/", "appends to a file under /etc"),
    ("shutdown", "shuts down the host"),
    ("poweroff", "powers off the host"),
    ("reboot", "reboots the host"),
    // Attempts to disable this safety layer.
    ("idlehands_disable_safety", "attempts to disable the safety system"),
    ("--no-safety", "attempts to disable the safety system"),
];

/// Cautious patterns: package management, privilege escalation, forced
/// history rewrites, broad permission changes.
const CAUTIOUS: &[(&str, &str)] = &[
    ("sudo ", "privilege escalation"),
    ("su ", "privilege escalation"),
    ("doas ", "privilege escalation"),
    ("apt install", "package installation"),
    ("apt-get install", "package installation"),
    ("apt remove", "package removal"),
    ("apt-get remove", "package removal"),
    ("dnf install", "package installation"),
    ("yum install", "package installation"),
    ("pacman -s", "package installation"),
    ("npm install -g", "global package installation"),
    ("pip install", "package installation"),
    ("cargo install", "package installation"),
    ("rm -rf", "recursive forced removal"),
    ("git push --force", "forced history rewrite"),
    ("git push -f", "forced history rewrite"),
    ("git reset --hard", "discards local changes"),
    ("git clean -fd", "deletes untracked files"),
    ("chmod -r", "recursive permission change"),
    ("chown -r", "recursive ownership change"),
];

/// Classify a shell command.
pub fn screen_command(command: &str) -> SafetyVerdict {
    let lower = command.trim().to_lowercase();
    for (pattern, reason) in FORBIDDEN {
        if lower.contains(pattern) {
            return SafetyVerdict::Forbidden {
                reason: format!("{reason} (matched `{pattern}`)"),
            };
        }
    }
    for (pattern, reason) in CAUTIOUS {
        if lower.contains(pattern) {
            return SafetyVerdict::Cautious {
                reason: format!("{reason} (matched `{pattern}`)"),
            };
        }
    }
    SafetyVerdict::Ok
}

/// Classify a filesystem mutation target.
pub fn screen_path(path: &Path) -> SafetyVerdict {
    const FORBIDDEN_ROOTS: &[&str] = &["/boot", "/dev", "/proc", "/sys", "/etc/passwd", "/etc/shadow", "/etc/sudoers"];
    const CAUTIOUS_ROOTS: &[&str] = &["/etc", "/usr", "/bin", "/sbin", "/lib", "/var"];

    // Scratch space is never a system path, wherever the OS puts it.
    if path.starts_with(std::env::temp_dir()) {
        return SafetyVerdict::Ok;
    }

    let s = path.to_string_lossy();
    for root in FORBIDDEN_ROOTS {
        if s == *root || s.starts_with(&format!("{root}/")) {
            return SafetyVerdict::Forbidden {
                reason: format!("mutation of protected path {root}"),
            };
        }
    }
    for root in CAUTIOUS_ROOTS {
        if s == *root || s.starts_with(&format!("{root}/")) {
            return SafetyVerdict::Cautious {
                reason: format!("mutation under system path {root}"),
            };
        }
    }
    SafetyVerdict::Ok
}

/// Detect an unquoted trailing `&` — background-execution intent is
/// rejected outright (the runtime cannot supervise detached processes).
pub fn has_background_intent(command: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut last_meaningful: Option<(usize, char)> = None;
    let chars: Vec<char> = command.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if !c.is_whitespace() && !in_single && !in_double => {
                last_meaningful = Some((i, c));
            }
            _ => {}
        }
    }
    match last_meaningful {
        // `&&` is sequencing, a single trailing `&` is backgrounding.
        Some((i, '&')) => !(i > 0 && chars[i - 1] == '&'),
        _ => false,
    }
}

/// Scan an exec command for sub-commands that leave the session scope:
/// `cd /abs` and absolute-path file creators.  Returns the offending
/// fragments.  `/tmp`, `/dev/null`, the cwd, and the allowed roots are
/// exempt.
pub fn command_scope_violations(command: &str, cwd: &Path, allowed: &[std::path::PathBuf]) -> Vec<String> {
    let mut violations = Vec::new();
    let exempt = |p: &str| -> bool {
        p.starts_with("/tmp") || p.starts_with("/dev/") || p == "/dev/null"
            || Path::new(p).starts_with(cwd)
            || allowed.iter().any(|root| Path::new(p).starts_with(root))
    };

    for segment in command.split(['|', ';', '&']) {
        let seg = segment.trim().trim_start_matches("& ");
        let words: Vec<&str> = seg.split_whitespace().collect();
        if words.len() >= 2 {
            let target_idx = match words[0] {
                "cd" | "touch" | "mkdir" | "tee" => Some(if words[1] == "-p" { 2 } else { 1 }),
                _ => None,
            };
            if let Some(idx) = target_idx {
                if let Some(target) = words.get(idx) {
                    if target.starts_with('/') && !exempt(target) {
                        violations.push(format!("{} {}", words[0], target));
                    }
                }
            }
        }
        // Redirection to an absolute path creates a file out of scope.
        if let Some(pos) = seg.find('>') {
            let after = seg[pos..].trim_start_matches('>').trim_start();
            if let Some(target) = after.split_whitespace().next() {
                if target.starts_with('/') && !exempt(target) {
                    violations.push(format!("> {target}"));
                }
            }
        }
    }
    violations
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
