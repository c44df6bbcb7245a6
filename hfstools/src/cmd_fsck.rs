use std::io::{self, BufRead, Write as IoWrite};

use hfsfs::check::{self, CheckContext, CheckOptions, Prompt, RepairMode, Severity};
use hfsfs::detect::{self, FsKind};
use hfsfs::device::BlockDevice;

use crate::host;
use crate::style::*;

/// Asks the operator on stdin, defaulting to no.
struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&mut self, question: &str) -> bool {
        eprint!("{question}? [y/N] ");
        io::stderr().flush().ok();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes" | "YES")
    }
}

struct FsckOptions {
    device: String,
    mode: RepairMode,
    force: bool,
    verbose: bool,
}

pub(crate) fn run(args: &[String], plus: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let opts = match parse_args(args) {
        Ok(Some(opts)) => opts,
        Ok(None) => return Ok(0),
        Err(message) => {
            eprintln!("{RED}error:{RESET} {message}");
            print_usage(plus);
            return Ok(check::EXIT_USAGE);
        }
    };

    if opts.mode != RepairMode::ReadOnly && host::is_mounted(&opts.device) {
        eprintln!(
            "{RED}error:{RESET} {} is mounted; only read-only checks (-n) are allowed",
            opts.device
        );
        return Ok(check::EXIT_OPERATIONAL);
    }

    let file = if opts.mode == RepairMode::ReadOnly {
        host::open_read_only(&opts.device)?
    } else {
        host::open_read_write(&opts.device)?
    };
    let mut dev = BlockDevice::new(file)?;

    // Program-name dispatch: fsck.hfs silently hands HFS+ volumes to the
    // HFS+ checker; fsck.hfsplus refuses plain HFS volumes.
    match detect::probe(&mut dev)? {
        Some(FsKind::Hfs) if plus => {
            eprintln!(
                "{RED}error:{RESET} {} is a plain HFS volume; run fsck.hfs instead",
                opts.device
            );
            return Ok(check::EXIT_USAGE);
        }
        Some(kind) if kind.is_plus() && !plus => {
            eprintln!("Detected {kind} filesystem, delegating to the HFS+ checker...");
        }
        _ => {}
    }

    let check_options = CheckOptions {
        mode: opts.mode,
        force: opts.force,
        verbose: opts.verbose,
    };
    let mut prompt = StdinPrompt;
    let mut ctx = CheckContext::new(check_options, &mut prompt);

    let summary = check::check_volume(&mut dev, &mut ctx)?;

    for finding in &summary.findings {
        if finding.severity == Severity::Info && !opts.verbose {
            continue;
        }
        let color = match finding.severity {
            Severity::Info => DIM,
            Severity::Warn => YELLOW,
            _ => RED,
        };
        eprintln!(
            "{color}{}{RESET}: {} [{}]: {}{}",
            finding.severity,
            finding.phase,
            finding.location,
            finding.description,
            if finding.fixed { " (fixed)" } else { "" }
        );
    }

    let code = summary.exit_code();
    match code {
        check::EXIT_OK => println!("{GREEN}** volume check completed: no errors found{RESET}"),
        check::EXIT_CORRECTED => {
            println!("{GREEN}** volume check completed: errors found and corrected{RESET}")
        }
        check::EXIT_CANCELLED => println!("{YELLOW}** volume check cancelled{RESET}"),
        _ => println!("{RED}** volume check completed: errors found but not corrected{RESET}"),
    }
    Ok(code)
}

fn parse_args(args: &[String]) -> Result<Option<FsckOptions>, String> {
    let mut opts = FsckOptions {
        device: String::new(),
        mode: RepairMode::Interactive,
        force: false,
        verbose: false,
    };
    let mut positional: Vec<&String> = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-n" | "--no-write" => opts.mode = RepairMode::ReadOnly,
            "-a" | "-p" | "-y" | "--auto" | "--yes" => opts.mode = RepairMode::Auto,
            "-r" => opts.mode = RepairMode::Interactive,
            "-f" | "--force" => opts.force = true,
            "-v" | "--verbose" => opts.verbose = true,
            "-h" | "--help" => return Ok(None),
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    match positional.len() {
        0 => Err("missing device argument".into()),
        1 => {
            opts.device = positional[0].clone();
            Ok(Some(opts))
        }
        _ => Err("too many arguments".into()),
    }
}

fn print_usage(plus: bool) {
    let name = if plus { "fsck.hfsplus" } else { "fsck.hfs" };
    eprintln!(
        r#"
{BOLD}{name}{RESET} — check and repair an {fs} filesystem

{BOLD}USAGE:{RESET}
    {name} [OPTIONS] <device-or-image>

{BOLD}OPTIONS:{RESET}
    -n              Check only, never write
    -a, -p, -y      Repair automatically (assume yes)
    -r              Ask before each repair (default)
    -f              Check even when the volume looks clean
    -v              Verbose output
    -h              Show this help

{BOLD}EXIT CODES:{RESET}
    0 clean, 1 corrected, 4 uncorrected, 8 operational error,
    16 usage, 32 cancelled, 128 internal
"#,
        fs = if plus { "HFS+" } else { "HFS" },
    );
}
