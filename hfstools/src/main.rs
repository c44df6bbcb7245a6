//! hfstools — mkfs, fsck and mount front-ends for HFS / HFS+ / HFSX.
//!
//! The binary dispatches on the basename it was invoked through, so the
//! usual hard links work:
//!
//! ```text
//! mkfs.hfs      [-f] [-L label] [-v] <device>
//! mkfs.hfsplus  [-f] [-L label] [-s size] [-j] [-c] [-v] <device>
//! fsck.hfs      [-n | -a | -p | -y | -r] [-f] [-v] <device>
//! fsck.hfsplus  same flags; refuses plain HFS volumes
//! mount.hfs     [-r | -w] [-o options] [-v] <device> <mount-point>
//! mount.hfsplus same flags
//! ```
//!
//! Invoked as plain `hfstools`, the first argument selects the tool by the
//! same names.

mod cmd_fsck;
mod cmd_mkfs;
mod cmd_mount;
mod host;
mod style;

use std::env;
use std::path::Path;
use std::process;

use style::{BOLD, DIM, GREEN, RED, RESET};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    let program = args
        .first()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    let (tool, rest): (&str, &[String]) = match program.as_str() {
        "mkfs.hfs" | "mkfs.hfsplus" | "mkfs.hfs+" | "fsck.hfs" | "fsck.hfsplus" | "fsck.hfs+"
        | "mount.hfs" | "mount.hfsplus" | "mount.hfs+" => (program.as_str(), &args[1..]),
        _ => {
            // Subcommand form: hfstools <tool> [args...]
            if args.len() < 2 {
                print_usage();
                process::exit(16);
            }
            match args[1].as_str() {
                "-h" | "--help" | "help" => {
                    print_usage();
                    process::exit(0);
                }
                tool => (tool, &args[2..]),
            }
        }
    };

    let result = match tool {
        "mkfs.hfs" => cmd_mkfs::run(rest, false),
        "mkfs.hfsplus" | "mkfs.hfs+" => cmd_mkfs::run(rest, true),
        "fsck.hfs" => cmd_fsck::run(rest, false),
        "fsck.hfsplus" | "fsck.hfs+" => cmd_fsck::run(rest, true),
        "mount.hfs" => cmd_mount::run(rest, false),
        "mount.hfsplus" | "mount.hfs+" => cmd_mount::run(rest, true),
        other => {
            eprintln!("{RED}Unknown tool: {other}{RESET}");
            print_usage();
            process::exit(16);
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{RED}error:{RESET} {e}");
            process::exit(8);
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"
{BOLD}hfstools{RESET} — HFS / HFS+ / HFSX volume utilities

{DIM}Link or invoke as mkfs.hfs, mkfs.hfsplus, fsck.hfs, fsck.hfsplus,
mount.hfs or mount.hfsplus; or pass the tool name as a subcommand.{RESET}

{BOLD}USAGE:{RESET}
    hfstools <TOOL> [OPTIONS]

{BOLD}TOOLS:{RESET}
    {GREEN}mkfs.hfs{RESET}       Create a classic HFS filesystem
    {GREEN}mkfs.hfsplus{RESET}   Create an HFS+ (or HFSX) filesystem
    {GREEN}fsck.hfs{RESET}       Check and repair; delegates HFS+ volumes
    {GREEN}fsck.hfsplus{RESET}   Check and repair HFS+ / HFSX
    {GREEN}mount.hfs{RESET}      Pre-flight and mount a classic HFS volume
    {GREEN}mount.hfsplus{RESET}  Pre-flight and mount an HFS+ volume

{BOLD}EXAMPLES:{RESET}
    mkfs.hfsplus -s 100M -L Backup backup.img
    fsck.hfsplus -y backup.img
    mount.hfsplus -r /dev/sdb2 /mnt/mac
"#
    );
}
