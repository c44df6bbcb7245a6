use std::process::Command;

use hfsfs::detect::FsKind;
use hfsfs::device::BlockDevice;
use hfsfs::volume::ATTR_SOFTWARE_LOCK;
use hfsfs::{read_volume_info, volume};

use crate::host;
use crate::style::*;

const EXIT_USAGE: i32 = 16;

struct MountOptions {
    device: String,
    mount_point: String,
    read_only: bool,
    extra: Option<String>,
    verbose: bool,
}

/// Thin pre-flight wrapper: probe the signature, sanity-check the volume and
/// the mount point, then hand off to the host's mount program with the
/// right filesystem type.
pub(crate) fn run(args: &[String], plus: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let mut opts = match parse_args(args) {
        Ok(Some(opts)) => opts,
        Ok(None) => return Ok(0),
        Err(message) => {
            eprintln!("{RED}error:{RESET} {message}");
            print_usage(plus);
            return Ok(EXIT_USAGE);
        }
    };

    if !host::is_directory(&opts.mount_point) {
        eprintln!("{RED}error:{RESET} {} is not a directory", opts.mount_point);
        return Ok(1);
    }

    let file = host::open_read_only(&opts.device)?;
    let mut dev = BlockDevice::new(file)?;
    let info = read_volume_info(&mut dev)?;

    let fs_type = match info.kind {
        FsKind::Hfs => "hfs",
        FsKind::HfsPlus | FsKind::Hfsx => "hfsplus",
    };
    if plus && info.kind == FsKind::Hfs {
        eprintln!("{RED}error:{RESET} {} is a plain HFS volume; run mount.hfs", opts.device);
        return Ok(EXIT_USAGE);
    }

    if info.kind.is_plus() {
        let vh = volume::read_primary(&mut dev)?;
        if vh.has_attribute(ATTR_SOFTWARE_LOCK) && !opts.read_only {
            eprintln!("{YELLOW}volume is software-locked; mounting read-only{RESET}");
            opts.read_only = true;
        }
        if vh.has_attribute(hfsfs::volume::ATTR_INCONSISTENT) {
            eprintln!(
                "{RED}error:{RESET} volume is marked inconsistent; run fsck.hfsplus first"
            );
            return Ok(1);
        }
        if info.journaled {
            eprintln!(
                "{YELLOW}note:{RESET} the Linux HFS+ driver ignores the journal on this volume"
            );
        }
    }
    drop(dev);

    if opts.verbose {
        kv("Volume", &info.name);
        kv("Type", info.kind.name());
        kv("Size", &format_size(info.total_blocks as u64 * info.block_size as u64));
        kv("Created", &format_hfs_date(info.create_date));
        kv("Modified", &format_hfs_date(info.modify_date));
    }

    let mut command = Command::new("mount");
    command.arg("-t").arg(fs_type);
    let mut mount_opts = Vec::new();
    if opts.read_only {
        mount_opts.push("ro".to_string());
    }
    if let Some(extra) = &opts.extra {
        mount_opts.push(extra.clone());
    }
    if !mount_opts.is_empty() {
        command.arg("-o").arg(mount_opts.join(","));
    }
    command.arg(&opts.device).arg(&opts.mount_point);

    log::debug!("executing {:?}", command);
    let status = command.status()?;
    Ok(status.code().unwrap_or(1))
}

fn parse_args(args: &[String]) -> Result<Option<MountOptions>, String> {
    let mut opts = MountOptions {
        device: String::new(),
        mount_point: String::new(),
        read_only: false,
        extra: None,
        verbose: false,
    };
    let mut positional: Vec<&String> = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-r" | "--read-only" => opts.read_only = true,
            "-w" | "--read-write" => opts.read_only = false,
            "-o" | "--options" => {
                let value = iter.next().ok_or("missing mount options")?;
                opts.extra = Some(value.clone());
            }
            "-v" | "--verbose" => opts.verbose = true,
            "-h" | "--help" => return Ok(None),
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    match positional.len() {
        2 => {
            opts.device = positional[0].clone();
            opts.mount_point = positional[1].clone();
            Ok(Some(opts))
        }
        n if n < 2 => Err("usage: mount.hfs <device> <mount-point>".into()),
        _ => Err("too many arguments".into()),
    }
}

fn print_usage(plus: bool) {
    let name = if plus { "mount.hfsplus" } else { "mount.hfs" };
    eprintln!(
        r#"
{BOLD}{name}{RESET} — mount an {fs} volume via the host mount program

{BOLD}USAGE:{RESET}
    {name} [OPTIONS] <device> <mount-point>

{BOLD}OPTIONS:{RESET}
    -r              Mount read-only
    -w              Mount read-write (default)
    -o <options>    Extra mount options, comma separated
    -v              Verbose output
    -h              Show this help
"#,
        fs = if plus { "HFS+" } else { "HFS" },
    );
}
