use hfsfs::device::BlockDevice;
use hfsfs::format::{self, PlusFormatOptions};

use crate::host;
use crate::style::*;

const EXIT_USAGE: i32 = 16;

struct MkfsOptions {
    device: String,
    label: Option<String>,
    size: Option<u64>,
    force: bool,
    journaled: bool,
    case_sensitive: bool,
    verbose: bool,
}

pub(crate) fn run(args: &[String], plus: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let opts = match parse_args(args, plus) {
        Ok(Some(opts)) => opts,
        Ok(None) => return Ok(0), // help printed
        Err(message) => {
            eprintln!("{RED}error:{RESET} {message}");
            print_usage(plus);
            return Ok(EXIT_USAGE);
        }
    };

    if opts.verbose {
        log::set_max_level(log::LevelFilter::Debug);
    }

    if host::is_mounted(&opts.device) {
        eprintln!("{RED}error:{RESET} {} is currently mounted", opts.device);
        return Ok(1);
    }

    // A size request means creating (or replacing) a disk image.
    let file = if let Some(size) = opts.size {
        host::create_image(&opts.device, size)?
    } else {
        host::open_read_write(&opts.device)?
    };
    let mut dev = BlockDevice::new(file)?;

    // Refuse to clobber a device that already carries data, unless forced.
    if opts.size.is_none() && !opts.force {
        let mut first = [0u8; 512];
        dev.read_at(0, &mut first)?;
        let has_signature = hfsfs::detect::probe(&mut dev).ok().flatten().is_some();
        if first.iter().any(|&b| b != 0) || has_signature {
            eprintln!(
                "{RED}error:{RESET} {} appears to contain data, use -f to force formatting",
                opts.device
            );
            return Ok(1);
        }
    }

    if opts.journaled {
        eprintln!();
        eprintln!("{YELLOW}WARNING: HFS+ journaling enabled{RESET}");
        eprintln!("The Linux HFS+ kernel driver does NOT support journaling.");
        eprintln!("Journaled volumes mount as NO_JOURNAL on Linux and work");
        eprintln!("correctly on macOS. For Linux-only use, journaling is NOT");
        eprintln!("recommended.");
        eprintln!();
    }

    let label = opts
        .label
        .clone()
        .unwrap_or_else(|| "Untitled".to_string());

    if plus {
        let format_options = PlusFormatOptions {
            label: label.clone(),
            journaled: opts.journaled,
            case_sensitive: opts.case_sensitive,
        };
        let vh = format::format_hfsplus(&mut dev, &format_options)?;
        let kind = if opts.case_sensitive { "HFSX" } else { "HFS+" };
        println!("{GREEN}{kind} volume '{label}' created{RESET}");
        kv("Block size", &format!("{} bytes", vh.block_size));
        kv("Total blocks", &vh.total_blocks.to_string());
        kv("Free blocks", &vh.free_blocks.to_string());
        kv("Volume size", &format_size(dev.size()));
        if opts.journaled {
            kv("Journal", "enabled");
        }
    } else {
        let mdb = format::format_hfs(&mut dev, &label)?;
        println!("{GREEN}HFS volume '{label}' created{RESET}");
        kv("Block size", &format!("{} bytes", mdb.alloc_block_size));
        kv("Total blocks", &mdb.total_blocks.to_string());
        kv("Free blocks", &mdb.free_blocks.to_string());
        kv("Volume size", &format_size(dev.size()));
    }

    Ok(0)
}

fn parse_args(args: &[String], plus: bool) -> Result<Option<MkfsOptions>, String> {
    let mut opts = MkfsOptions {
        device: String::new(),
        label: None,
        size: None,
        force: false,
        journaled: false,
        case_sensitive: false,
        verbose: false,
    };
    let mut positional: Vec<&String> = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-f" | "--force" => opts.force = true,
            "-v" | "--verbose" => opts.verbose = true,
            "-L" | "-l" | "--label" => {
                let value = iter.next().ok_or("missing volume label")?;
                opts.label = Some(value.clone());
            }
            "-s" | "--size" => {
                if !plus {
                    return Err("-s is only supported for HFS+".into());
                }
                let value = iter.next().ok_or("missing size")?;
                opts.size = Some(parse_size(value, plus)?);
            }
            "-j" | "--journal" => {
                if !plus {
                    return Err("-j is only supported for HFS+".into());
                }
                opts.journaled = true;
            }
            "-c" | "--case-sensitive" => {
                if !plus {
                    return Err("-c is only supported for HFS+".into());
                }
                opts.case_sensitive = true;
            }
            "-h" | "--help" => {
                print_usage(plus);
                return Ok(None);
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            _ => positional.push(arg),
        }
    }

    match positional.len() {
        0 => return Err("missing device argument".into()),
        1 => opts.device = positional[0].clone(),
        _ => return Err("too many arguments".into()),
    }
    if let Some(label) = &opts.label {
        format::validate_label(label, plus).map_err(|e| e.to_string())?;
    }
    Ok(Some(opts))
}

/// Parse `N[K|M|G]` into bytes, enforcing the per-variant minimum.
pub(crate) fn parse_size(text: &str, plus: bool) -> Result<u64, String> {
    let (digits, suffix) = match text.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => text.split_at(at),
        None => (text, ""),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size specification: {text}"))?;
    let multiplier = match suffix {
        "" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return Err(format!("invalid size suffix: {suffix}")),
    };
    let size = value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {text}"))?;

    let minimum: u64 = if plus { 10 * 1024 * 1024 } else { 800 * 1024 };
    if size < minimum {
        return Err(format!(
            "{} filesystem size must be at least {}",
            if plus { "HFS+" } else { "HFS" },
            if plus { "10MB" } else { "800KB" }
        ));
    }
    Ok(size)
}

fn print_usage(plus: bool) {
    let name = if plus { "mkfs.hfsplus" } else { "mkfs.hfs" };
    eprintln!(
        r#"
{BOLD}{name}{RESET} — create an {fs} filesystem

{BOLD}USAGE:{RESET}
    {name} [OPTIONS] <device-or-image>

{BOLD}OPTIONS:{RESET}
    -f              Force formatting over existing data
    -L <label>      Volume label (also -l)
    {extra}-v              Verbose output
    -h              Show this help
"#,
        fs = if plus { "HFS+" } else { "HFS" },
        extra = if plus {
            "-s <size[K|M|G]> Create a disk image of the given size\n    -j              Enable journaling (not supported by the Linux driver)\n    -c              Case-sensitive (HFSX)\n    "
        } else {
            ""
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("800K", false).unwrap(), 800 * 1024);
        assert_eq!(parse_size("100M", true).unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("2G", true).unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("10x", true).is_err());
        assert!(parse_size("", true).is_err());
    }

    #[test]
    fn test_parse_size_minimums() {
        assert!(parse_size("1M", true).is_err()); // below 10 MB
        assert!(parse_size("10M", true).is_ok());
        assert!(parse_size("500K", false).is_err()); // below 800 KB
    }
}
