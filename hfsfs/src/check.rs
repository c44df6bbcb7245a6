//! Phased consistency check and repair.
//!
//! Phases run in strict dependency order; a critical failure in an earlier
//! phase aborts the later ones. All policy flows through an explicit
//! `CheckContext` — repair mode, operator prompt, interrupt flag — instead
//! of process globals. Every violation becomes a structured `Finding`; the
//! summary folds findings into the conventional fsck exit code.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::bitmap::Bitmap;
use crate::btree::{self, BTree, DefectKind, NODE_DESCRIPTOR_SIZE};
use crate::catalog::{self, CatalogRecord, HfsCatalogRecord, CNID_ALLOCATION_FILE,
    CNID_ATTRIBUTES_FILE, CNID_CATALOG_FILE, CNID_EXTENTS_FILE, CNID_ROOT_FOLDER,
    CNID_STARTUP_FILE};
use crate::detect::{now_hfs, probe, FsKind};
use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::extents::{self, ForkMap, FORK_TYPE_DATA, FORK_TYPE_RESOURCE};
use crate::journal;
use crate::mdb::Mdb;
use crate::volume::{self, VolumeHeader, ATTR_INCONSISTENT, HFS_PLUS_VERSION,
    VOLUME_HEADER_OFFSET};

// Standard fsck exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CORRECTED: i32 = 1;
pub const EXIT_UNCORRECTED: i32 = 4;
pub const EXIT_OPERATIONAL: i32 = 8;
pub const EXIT_USAGE: i32 = 16;
pub const EXIT_CANCELLED: i32 = 32;
pub const EXIT_INTERNAL: i32 = 128;

/// How much the checker may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Never write; report everything.
    ReadOnly,
    /// Ask the operator before each repair.
    Interactive,
    /// Assume yes to every repair.
    Auto,
}

/// Operator confirmation hook for interactive repairs.
pub trait Prompt {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Answers yes to everything.
pub struct AssumeYes;
impl Prompt for AssumeYes {
    fn confirm(&mut self, _question: &str) -> bool {
        true
    }
}

/// Answers no to everything.
pub struct AssumeNo;
impl Prompt for AssumeNo {
    fn confirm(&mut self, _question: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub mode: RepairMode,
    /// Check even when the volume looks clean. Kept for interface parity;
    /// every phase runs regardless, since a clean-looking header says
    /// nothing about the trees beneath it.
    pub force: bool,
    pub verbose: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            mode: RepairMode::ReadOnly,
            force: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Header,
    Journal,
    Bitmap,
    ExtentsTree,
    CatalogTree,
    AttributesTree,
    CrossChecks,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Header => "header",
            Phase::Journal => "journal",
            Phase::Bitmap => "allocation bitmap",
            Phase::ExtentsTree => "extents B-tree",
            Phase::CatalogTree => "catalog B-tree",
            Phase::AttributesTree => "attributes B-tree",
            Phase::CrossChecks => "catalog cross-checks",
            Phase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warn => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One detected violation, fixed or not.
#[derive(Debug, Clone)]
pub struct Finding {
    pub phase: Phase,
    pub severity: Severity,
    pub location: String,
    pub description: String,
    pub fixed: bool,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} [{}]: {}{}",
            self.severity,
            self.phase,
            self.location,
            self.description,
            if self.fixed { " (fixed)" } else { "" }
        )
    }
}

/// The result of a full run.
#[derive(Debug, Default)]
pub struct CheckSummary {
    pub findings: Vec<Finding>,
    pub repaired: bool,
    pub cancelled: bool,
}

impl CheckSummary {
    pub fn has_uncorrected(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity >= Severity::Error && !f.fixed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else if self.has_uncorrected() {
            EXIT_UNCORRECTED
        } else if self.repaired {
            EXIT_CORRECTED
        } else {
            EXIT_OK
        }
    }
}

/// Carries repair policy and accumulates findings across phases.
pub struct CheckContext<'a> {
    pub options: CheckOptions,
    prompt: &'a mut dyn Prompt,
    interrupt: Arc<AtomicBool>,
    findings: Vec<Finding>,
    repaired: bool,
}

impl<'a> CheckContext<'a> {
    pub fn new(options: CheckOptions, prompt: &'a mut dyn Prompt) -> Self {
        CheckContext {
            options,
            prompt,
            interrupt: Arc::new(AtomicBool::new(false)),
            findings: Vec::new(),
            repaired: false,
        }
    }

    /// Sticky interrupt flag, consulted between phases. A signal handler
    /// may store `true` at any time; the run then stops at the next phase
    /// boundary with exit code 32.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(AtomicOrdering::Relaxed)
    }

    /// Whether a proposed repair should be applied under the current mode.
    fn want_fix(&mut self, question: &str) -> bool {
        match self.options.mode {
            RepairMode::ReadOnly => false,
            RepairMode::Auto => true,
            RepairMode::Interactive => self.prompt.confirm(question),
        }
    }

    fn push(&mut self, phase: Phase, severity: Severity, location: &str, description: String, fixed: bool) {
        if fixed {
            self.repaired = true;
            log::info!("{}: {} — repaired", phase, description);
        } else if severity >= Severity::Error {
            log::warn!("{}: {}", phase, description);
        }
        self.findings.push(Finding {
            phase,
            severity,
            location: location.to_string(),
            description,
            fixed,
        });
    }

    fn take_summary(&mut self, cancelled: bool) -> CheckSummary {
        CheckSummary {
            findings: std::mem::take(&mut self.findings),
            repaired: self.repaired,
            cancelled,
        }
    }
}

/// Probe the device and run the matching checker.
pub fn check_volume<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
) -> Result<CheckSummary> {
    // The checker reads every structure from the medium, never from a
    // possibly stale cache entry.
    dev.set_caching(false);
    match probe(dev)? {
        Some(FsKind::Hfs) => check_hfs(dev, ctx),
        Some(_) => check_hfsplus(dev, ctx),
        None => {
            // The primary signature is gone; the alternate header may still
            // identify the volume.
            let mut alt = vec![0u8; 512];
            dev.read_at(dev.size() - 1024, &mut alt)?;
            if VolumeHeader::decode(&alt).is_ok() {
                check_hfsplus(dev, ctx)
            } else if Mdb::decode(&alt).is_ok() {
                check_hfs(dev, ctx)
            } else {
                Err(HfsError::NotAFilesystem)
            }
        }
    }
}

// ── HFS+ ─────────────────────────────────────────────────────────────────

/// Expected B-tree node size on an HFS+ volume. The formatter always lays
/// out 4096-byte nodes; volumes with blocks above that use block-sized
/// nodes.
fn plus_node_size(block_size: u32) -> u16 {
    block_size.max(4096).min(32_768) as u16
}

fn check_hfsplus<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
) -> Result<CheckSummary> {
    let mut header_dirty = false;
    let mut abort = false;

    // Phase 1: header.
    let mut vh = match volume::read_primary(dev) {
        Ok(vh) => vh,
        Err(primary_err) => {
            let alt = volume::read_alternate(dev).map_err(|_| HfsError::BothHeadersCorrupt)?;
            let fixed = ctx.want_fix("Restore volume header from the alternate copy");
            if fixed {
                dev.write_at(VOLUME_HEADER_OFFSET, &alt.encode()?)?;
                dev.sync()?;
            }
            ctx.push(
                Phase::Header,
                Severity::Error,
                "offset 1024",
                format!("primary volume header unusable ({}); alternate copy is sound", primary_err),
                fixed,
            );
            alt
        }
    };

    let now = now_hfs();
    if vh.version != HFS_PLUS_VERSION {
        let claimed = vh.version;
        let fixed = ctx.want_fix("Fix volume header version");
        if fixed {
            vh.version = HFS_PLUS_VERSION;
            header_dirty = true;
        }
        ctx.push(
            Phase::Header,
            Severity::Warn,
            "version",
            format!("volume header version {} (expected {})", claimed, HFS_PLUS_VERSION),
            fixed,
        );
    }
    for (field, value) in [
        ("create date", vh.create_date),
        ("modify date", vh.modify_date),
        ("checked date", vh.checked_date),
    ] {
        if value > now {
            let fixed = ctx.want_fix(&format!("Clamp {} to the current time", field));
            if fixed {
                match field {
                    "create date" => vh.create_date = now,
                    "modify date" => vh.modify_date = now,
                    _ => vh.checked_date = now,
                }
                header_dirty = true;
            }
            ctx.push(
                Phase::Header,
                Severity::Warn,
                field,
                format!("{} is in the future (Y2K40 hazard)", field),
                fixed,
            );
        }
    }
    if vh.has_attribute(ATTR_INCONSISTENT) {
        ctx.push(
            Phase::Header,
            Severity::Info,
            "attributes",
            "volume is marked inconsistent (dirty)".into(),
            false,
        );
    }

    // Phase 2: journal.
    if vh.is_journaled() && !ctx.interrupted() {
        plus_journal_phase(dev, ctx, &mut vh, &mut abort)?;
    }

    // Open the trees every later phase needs.
    let mut extents_tree = None;
    let mut catalog_tree = None;
    if !abort {
        match BTree::open(dev, ForkMap::from_fork(&vh.extents_file, vh.block_size)) {
            Ok(tree) => extents_tree = Some(tree),
            Err(e) => {
                ctx.push(Phase::ExtentsTree, Severity::Critical, "header node",
                    format!("extents tree unusable: {}", e), false);
                abort = true;
            }
        }
        match BTree::open(dev, ForkMap::from_fork(&vh.catalog_file, vh.block_size)) {
            Ok(tree) => catalog_tree = Some(tree),
            Err(e) => {
                ctx.push(Phase::CatalogTree, Severity::Critical, "header node",
                    format!("catalog tree unusable: {}", e), false);
                abort = true;
            }
        }
    }

    // Phase 3: allocation bitmap.
    if !abort && !ctx.interrupted() {
        let extents_tree = extents_tree.as_ref().unwrap();
        let catalog_tree = catalog_tree.as_ref().unwrap();
        abort = plus_bitmap_phase(dev, ctx, &mut vh, extents_tree, catalog_tree, &mut header_dirty)?;
    }

    // Phases 4-6: tree structure.
    if !abort && !ctx.interrupted() {
        let expected = plus_node_size(vh.block_size);
        if let Some(tree) = extents_tree.as_mut() {
            let critical = tree_phase(dev, ctx, Phase::ExtentsTree, tree, expected,
                &extents::compare_plus_extent_records)?;
            abort = abort || critical;
        }
        if let Some(tree) = catalog_tree.as_mut() {
            let sensitive = vh.is_hfsx() && tree.header.key_compare_type == btree::KEY_COMPARE_BINARY;
            let compare = move |a: &[u8], b: &[u8]| catalog::compare_plus_catalog_records(a, b, sensitive);
            let critical = tree_phase(dev, ctx, Phase::CatalogTree, tree, expected, &compare)?;
            abort = abort || critical;
        }
        if !vh.attributes_file.is_empty() {
            match BTree::open(dev, ForkMap::from_fork(&vh.attributes_file, vh.block_size)) {
                Ok(mut tree) => {
                    if !tree.is_empty() {
                        tree_phase(dev, ctx, Phase::AttributesTree, &mut tree, expected,
                            &crate::attributes::compare_attribute_records)?;
                    }
                }
                Err(e) => {
                    ctx.push(Phase::AttributesTree, Severity::Error, "header node",
                        format!("attributes tree unusable: {}", e), false);
                }
            }
        }
    }

    // Phase 7: catalog cross-checks.
    if !abort && !ctx.interrupted() {
        let extents_tree = extents_tree.as_ref().unwrap();
        let catalog_tree = catalog_tree.as_mut().unwrap();
        plus_cross_checks(dev, ctx, &mut vh, extents_tree, catalog_tree, &mut header_dirty)?;
    }

    let cancelled = ctx.interrupted();

    // Phase 8: finalize.
    if (ctx.repaired || header_dirty) && ctx.options.mode != RepairMode::ReadOnly && !cancelled {
        vh.checked_date = now_hfs();
        vh.write_count = vh.write_count.wrapping_add(1);
        let clean_pass = !ctx
            .findings
            .iter()
            .any(|f| f.severity >= Severity::Error && !f.fixed);
        if clean_pass {
            vh.attributes &= !ATTR_INCONSISTENT;
        }
        volume::write_both(dev, &vh)?;
        ctx.repaired = true;
    }

    Ok(ctx.take_summary(cancelled))
}

fn plus_journal_phase<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    vh: &mut VolumeHeader,
    abort: &mut bool,
) -> Result<()> {
    match journal::validate(dev, vh) {
        Ok(mut j) => {
            if j.is_clean() {
                if ctx.options.verbose {
                    ctx.push(Phase::Journal, Severity::Info, "journal",
                        "journal is clean, no replay needed".into(), false);
                }
                return Ok(());
            }
            if ctx.options.mode == RepairMode::ReadOnly {
                ctx.push(Phase::Journal, Severity::Error, "journal",
                    "journal has pending transactions; run with repair to replay".into(), false);
                return Ok(());
            }
            if ctx.want_fix("Replay journal transactions") {
                match journal::replay(dev, vh, &mut j, true) {
                    Ok(n) => {
                        ctx.push(Phase::Journal, Severity::Error, "journal",
                            format!("replayed {} pending transaction(s)", n), true);
                        // The replay may have rewritten the header block.
                        if let Ok(fresh) = volume::read_primary(dev) {
                            *vh = fresh;
                        }
                    }
                    Err(e) => {
                        disable_or_abort(dev, ctx, vh, abort,
                            format!("journal replay failed: {}", e))?;
                    }
                }
            } else {
                ctx.push(Phase::Journal, Severity::Error, "journal",
                    "journal has pending transactions (replay declined)".into(), false);
                *abort = true;
            }
            Ok(())
        }
        Err(e) => {
            if ctx.options.mode == RepairMode::ReadOnly {
                ctx.push(Phase::Journal, Severity::Error, "journal",
                    format!("journal is invalid: {}", e), false);
                return Ok(());
            }
            disable_or_abort(dev, ctx, vh, abort, format!("journal is invalid: {}", e))
        }
    }
}

fn disable_or_abort<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    vh: &mut VolumeHeader,
    abort: &mut bool,
    why: String,
) -> Result<()> {
    if ctx.want_fix("Disable journaling to continue") {
        journal::disable(dev, vh)?;
        ctx.push(Phase::Journal, Severity::Error, "journal",
            format!("{}; journaling disabled", why), true);
    } else {
        ctx.push(Phase::Journal, Severity::Critical, "journal", why, false);
        *abort = true;
    }
    Ok(())
}

/// Accumulate the expected allocation state and reconcile it with the
/// on-disk bitmap and the header's free-block count. Returns `true` when a
/// double claim forces an abort.
fn plus_bitmap_phase<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    vh: &mut VolumeHeader,
    extents_tree: &BTree,
    catalog_tree: &BTree,
    header_dirty: &mut bool,
) -> Result<bool> {
    let bs = vh.block_size;
    let total = vh.total_blocks;
    let mut expected = Bitmap::new(total);
    let mut double_claims: Vec<u32> = Vec::new();
    let mut out_of_range: Vec<String> = Vec::new();

    {
        let mut claim = |owner: &str, start: u32, count: u32| {
            let end = start.saturating_add(count);
            if end > total {
                out_of_range.push(format!(
                    "{}: extent {}+{} runs past block {}",
                    owner, start, count, total
                ));
            }
            for b in start..end.min(total) {
                if expected.claim(b) {
                    double_claims.push(b);
                }
            }
        };

        // Reserved regions: boot blocks + header up front, alternate header
        // at the tail.
        let front = ((1536 + bs as u64 - 1) / bs as u64) as u32;
        claim("reserved", 0, front);
        let tail_start = ((dev.size() - 1024) / bs as u64) as u32;
        claim("reserved", tail_start, total - tail_start);

        // Journal area.
        if vh.is_journaled() && vh.journal_info_block != 0 && vh.journal_info_block < total {
            claim("journal info block", vh.journal_info_block, 1);
            let mut jib_buf = vec![0u8; bs as usize];
            dev.read_at(vh.journal_info_block as u64 * bs as u64, &mut jib_buf)?;
            if let Ok(info) = journal::JournalInfoBlock::decode(&jib_buf) {
                if info.offset % bs as u64 == 0 && info.size > 0 {
                    claim(
                        "journal",
                        (info.offset / bs as u64) as u32,
                        ((info.size + bs as u64 - 1) / bs as u64) as u32,
                    );
                }
            }
        }

        // System files.
        let system = [
            ("allocation file", CNID_ALLOCATION_FILE, &vh.allocation_file),
            ("extents file", CNID_EXTENTS_FILE, &vh.extents_file),
            ("catalog file", CNID_CATALOG_FILE, &vh.catalog_file),
            ("attributes file", CNID_ATTRIBUTES_FILE, &vh.attributes_file),
            ("startup file", CNID_STARTUP_FILE, &vh.startup_file),
        ];
        for (owner, cnid, fork) in system {
            if fork.is_empty() {
                continue;
            }
            extents::walk_fork_extents(
                dev,
                extents_tree,
                true,
                cnid,
                FORK_TYPE_DATA,
                &fork.extents,
                fork.total_blocks as u64,
                |start, count| claim(owner, start, count),
            )?;
        }

        // User files: collect forks during the leaf walk, then resolve
        // overflow chains (the walk itself holds the device).
        let mut forks: Vec<(u32, u8, crate::volume::ForkData)> = Vec::new();
        let walk = catalog_tree.walk_leaves(dev, |_, _, record| {
            if let Ok((_, payload)) = catalog::parse_catalog_key(record) {
                if let Ok(CatalogRecord::File(file)) = catalog::parse_catalog_record(&record[payload..]) {
                    forks.push((file.file_id, FORK_TYPE_DATA, file.data_fork));
                    forks.push((file.file_id, FORK_TYPE_RESOURCE, file.resource_fork));
                }
            }
            Ok(true)
        });
        if let Err(e) = walk {
            ctx.push(Phase::Bitmap, Severity::Warn, "catalog",
                format!("catalog walk incomplete during bitmap accumulation: {}", e), false);
        }
        for (cnid, fork_type, fork) in forks {
            if fork.is_empty() {
                continue;
            }
            let owner = format!("file {}", cnid);
            extents::walk_fork_extents(
                dev,
                extents_tree,
                true,
                cnid,
                fork_type,
                &fork.extents,
                fork.total_blocks as u64,
                |start, count| claim(&owner, start, count),
            )?;
        }
    }

    for message in out_of_range {
        ctx.push(Phase::Bitmap, Severity::Error, "extents", message, false);
    }

    if !double_claims.is_empty() {
        double_claims.sort_unstable();
        double_claims.dedup();
        ctx.push(
            Phase::Bitmap,
            Severity::Critical,
            "allocation",
            format!(
                "{} block(s) claimed by more than one owner (first: {})",
                double_claims.len(),
                double_claims[0]
            ),
            false,
        );
        // Cross-linked files cannot be reconciled automatically; read-only
        // runs keep reporting, anything else stops here.
        if ctx.options.mode != RepairMode::ReadOnly {
            return Ok(true);
        }
    }

    // On-disk bitmap.
    let alloc_map = ForkMap::from_fork(&vh.allocation_file, bs);
    let mut disk_bytes = vec![0u8; Bitmap::byte_len(total)];
    alloc_map.read_exact(dev, 0, &mut disk_bytes)?;
    let disk = Bitmap::from_bytes(disk_bytes, total);

    let orphans = disk.orphans(&expected);
    let missing = disk.missing(&expected);
    let mut bitmap_rewritten = false;

    if !orphans.is_empty() {
        let fixed = ctx.want_fix("Free blocks that are marked used but have no owner");
        if fixed {
            bitmap_rewritten = true;
        }
        ctx.push(Phase::Bitmap, Severity::Warn, "allocation",
            format!("{} block(s) marked used but unowned (first: {})", orphans.len(), orphans[0]),
            fixed);
    }
    if !missing.is_empty() {
        let fixed = ctx.want_fix("Mark allocated blocks as used in the bitmap");
        if fixed {
            bitmap_rewritten = true;
        }
        ctx.push(Phase::Bitmap, Severity::Error, "allocation",
            format!("{} allocated block(s) not marked used (first: {})", missing.len(), missing[0]),
            fixed);
    }
    if bitmap_rewritten {
        let mut bytes = vec![0u8; Bitmap::byte_len(total)];
        let len = bytes.len();
        bytes.copy_from_slice(&expected.as_bytes()[..len]);
        alloc_map.write_all(dev, 0, &bytes)?;
        dev.sync()?;
    }

    // Header free-block count against the (possibly reconciled) bitmap.
    let counted = if bitmap_rewritten { expected.count_free() } else { disk.count_free() };
    if counted != vh.free_blocks {
        let claimed = vh.free_blocks;
        let fixed = ctx.want_fix("Overwrite the header free-block count with the counted value");
        if fixed {
            vh.free_blocks = counted;
            *header_dirty = true;
        }
        ctx.push(Phase::Bitmap, Severity::Error, "free blocks",
            format!("header claims {} free blocks, bitmap counts {}", claimed, counted),
            fixed);
    }

    Ok(false)
}

/// Structural check of one tree, applying single-node repairs per the
/// decision matrix. Returns `true` when an unrepairable defect remains.
fn tree_phase<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    phase: Phase,
    tree: &mut BTree,
    expected_node_size: u16,
    compare: &dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering,
) -> Result<bool> {
    let mut critical = false;

    if tree.header.node_size != expected_node_size {
        // Node size disagreement is non-critical; the header record is
        // patched in place on disk, while reads keep using the size the
        // tree was actually laid out with.
        let fixed = ctx.want_fix("Rewrite the B-tree node size");
        if fixed {
            let mut node0 = tree.read_node_raw(dev, 0)?;
            BigEndian::write_u16(&mut node0[NODE_DESCRIPTOR_SIZE + 18..], expected_node_size);
            tree.write_node_raw(dev, 0, &node0)?;
        }
        ctx.push(phase, Severity::Error, "header record",
            format!("node size {} does not match the expected {}", tree.header.node_size, expected_node_size),
            fixed);
    }

    let result = btree::validate(dev, tree, compare)?;
    let mut duplicates: Vec<(u32, u16)> = Vec::new();
    let mut leaf_count_fix = false;

    for defect in &result.defects {
        let location = if let Some(r) = defect.record {
            format!("node {} record {}", defect.node, r)
        } else {
            format!("node {}", defect.node)
        };
        match defect.kind {
            DefectKind::NodeKind | DefectKind::RecordCount => {
                let fixed = ctx.want_fix("Rewrite the broken node descriptor");
                if fixed {
                    btree::repair_node_descriptor(dev, tree, defect.node, true)?;
                }
                ctx.push(phase, Severity::Error, &location, defect.detail.clone(), fixed);
            }
            DefectKind::BackLink => {
                let fixed = ctx.want_fix("Fix the leaf backward link");
                if fixed {
                    if let Some(correct) = defect.hint {
                        let mut raw = tree.read_node_raw(dev, defect.node)?;
                        BigEndian::write_u32(&mut raw[4..], correct);
                        tree.write_node_raw(dev, defect.node, &raw)?;
                    }
                }
                ctx.push(phase, Severity::Warn, &location, defect.detail.clone(), fixed);
            }
            DefectKind::DuplicateKey => {
                let fixed = ctx.want_fix("Delete the later duplicate record");
                if fixed {
                    duplicates.push((defect.node, defect.record.unwrap_or(0)));
                }
                ctx.push(phase, Severity::Error, &location, defect.detail.clone(), fixed);
            }
            DefectKind::LeafCount => {
                let fixed = ctx.want_fix("Correct the header leaf-record count");
                if fixed {
                    leaf_count_fix = true;
                }
                ctx.push(phase, Severity::Error, &location, defect.detail.clone(), fixed);
            }
            DefectKind::KeyOrder => {
                ctx.push(phase, Severity::Critical, &location,
                    format!("{} — key out of order, not repairable", defect.detail), false);
                critical = true;
            }
            DefectKind::HeaderBounds | DefectKind::OffsetTable | DefectKind::ChainEnd
            | DefectKind::Cycle => {
                ctx.push(phase, Severity::Critical, &location, defect.detail.clone(), false);
                critical = true;
            }
        }
    }

    // Apply duplicate deletions per node, highest record index first, so
    // earlier indices stay valid.
    duplicates.sort_unstable_by(|a, b| (a.0, std::cmp::Reverse(a.1)).cmp(&(b.0, std::cmp::Reverse(b.1))));
    let removed = duplicates.len() as u32;
    for (node_index, record) in duplicates {
        let mut node = tree.read_node(dev, node_index)?;
        node.remove_record(record as usize)?;
        tree.write_node(dev, &node)?;
    }
    if removed > 0 {
        tree.header.leaf_records = tree.header.leaf_records.saturating_sub(removed);
        tree.write_header(dev)?;
    } else if leaf_count_fix {
        tree.header.leaf_records = result.leaf_records as u32;
        tree.write_header(dev)?;
    }

    Ok(critical)
}

/// A forward catalog entry seen during the cross-check walk.
struct SeenEntry {
    parent: u32,
    name: Vec<u16>,
    folder: bool,
}

fn plus_cross_checks<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    vh: &mut VolumeHeader,
    extents_tree: &BTree,
    catalog_tree: &mut BTree,
    header_dirty: &mut bool,
) -> Result<()> {
    let sensitive = vh.is_hfsx();
    let mut files: u32 = 0;
    let mut folders: u32 = 0;
    let mut forward: HashMap<u32, SeenEntry> = HashMap::new();
    let mut threads: HashMap<u32, (u32, Vec<u16>)> = HashMap::new();
    let mut fork_checks: Vec<(u32, u8, crate::volume::ForkData)> = Vec::new();

    let walk = catalog_tree.walk_leaves(dev, |_, _, record| {
        let Ok((key, payload)) = catalog::parse_catalog_key(record) else {
            return Ok(true);
        };
        match catalog::parse_catalog_record(&record[payload..]) {
            Ok(CatalogRecord::Folder(folder)) => {
                folders += 1;
                forward.insert(folder.folder_id, SeenEntry {
                    parent: key.parent_id,
                    name: key.node_name.clone(),
                    folder: true,
                });
            }
            Ok(CatalogRecord::File(file)) => {
                files += 1;
                forward.insert(file.file_id, SeenEntry {
                    parent: key.parent_id,
                    name: key.node_name.clone(),
                    folder: false,
                });
                fork_checks.push((file.file_id, FORK_TYPE_DATA, file.data_fork));
                fork_checks.push((file.file_id, FORK_TYPE_RESOURCE, file.resource_fork));
            }
            Ok(CatalogRecord::FolderThread(t)) | Ok(CatalogRecord::FileThread(t)) => {
                threads.insert(key.parent_id, (t.parent_id, t.node_name));
            }
            Err(_) => {}
        }
        Ok(true)
    });
    if let Err(e) = walk {
        ctx.push(Phase::CrossChecks, Severity::Error, "catalog",
            format!("catalog walk failed: {}", e), false);
        return Ok(());
    }

    // Thread pairing, both directions.
    let mut forward_cnids: Vec<u32> = forward.keys().copied().collect();
    forward_cnids.sort_unstable();
    for cnid in forward_cnids {
        let entry = &forward[&cnid];
        if threads.contains_key(&cnid) {
            continue;
        }
        let fixed = ctx.want_fix("Synthesize the missing thread record");
        let mut applied = false;
        if fixed {
            let mut record = catalog::encode_catalog_key(cnid, &[]);
            record.extend_from_slice(&catalog::encode_thread_record(
                entry.folder,
                entry.parent,
                &entry.name,
            ));
            applied = insert_leaf_record(dev, catalog_tree, &record, &|a, b| {
                catalog::compare_plus_catalog_records(a, b, sensitive)
            })?;
            if !applied {
                ctx.push(Phase::CrossChecks, Severity::Warn, &format!("CNID {}", cnid),
                    "no room in the leaf node for a synthesized thread".into(), false);
            }
        }
        ctx.push(
            Phase::CrossChecks,
            Severity::Error,
            &format!("CNID {}", cnid),
            format!("{} record has no thread record", if entry.folder { "folder" } else { "file" }),
            applied,
        );
    }

    let mut thread_cnids: Vec<u32> = threads.keys().copied().collect();
    thread_cnids.sort_unstable();
    for cnid in thread_cnids {
        if forward.contains_key(&cnid) {
            continue;
        }
        let fixed = ctx.want_fix("Delete the orphan thread record");
        let mut applied = false;
        if fixed {
            applied = delete_leaf_record(dev, catalog_tree, &|record| {
                match catalog::parse_catalog_key(record) {
                    Ok((key, _)) => key
                        .compare(&catalog::CatalogKey { parent_id: cnid, node_name: vec![] }, sensitive),
                    Err(_) => std::cmp::Ordering::Less,
                }
            })?;
        }
        ctx.push(
            Phase::CrossChecks,
            Severity::Error,
            &format!("CNID {}", cnid),
            "thread record has no matching file or folder record".into(),
            applied,
        );
    }

    // Fork extents vs logical sizes.
    for (cnid, fork_type, fork) in fork_checks {
        if fork.logical_size == 0 && fork.total_blocks == 0 {
            continue;
        }
        let needed = (fork.logical_size + vh.block_size as u64 - 1) / vh.block_size as u64;
        let allocated = extents::walk_fork_extents(
            dev, extents_tree, true, cnid, fork_type, &fork.extents, needed, |_, _| {},
        )?;
        if allocated < needed {
            // Truncating the fork loses data; only explicit operator consent
            // may shrink the recorded size.
            let consent = ctx.options.mode == RepairMode::Interactive
                && ctx.want_fix("Clamp the fork's logical size to the allocated size (data loss)");
            let mut applied = false;
            if consent {
                applied = clamp_fork_size(
                    dev, catalog_tree, sensitive, cnid, fork_type,
                    allocated * vh.block_size as u64,
                )?;
            }
            ctx.push(
                Phase::CrossChecks,
                Severity::Error,
                &format!("CNID {}", cnid),
                format!(
                    "{} fork claims {} block(s) but only {} are allocated",
                    if fork_type == FORK_TYPE_DATA { "data" } else { "resource" },
                    needed, allocated
                ),
                applied,
            );
        }
    }

    // Header counts. The root folder itself is not part of folderCount.
    let observed_folders = folders.saturating_sub(1);
    if vh.folder_count != observed_folders {
        let claimed = vh.folder_count;
        let fixed = ctx.want_fix("Overwrite the header folder count");
        if fixed {
            vh.folder_count = observed_folders;
            *header_dirty = true;
        }
        ctx.push(Phase::CrossChecks, Severity::Error, "folder count",
            format!("header claims {} folders, catalog holds {}", claimed, observed_folders),
            fixed);
    }
    if vh.file_count != files {
        let claimed = vh.file_count;
        let fixed = ctx.want_fix("Overwrite the header file count");
        if fixed {
            vh.file_count = files;
            *header_dirty = true;
        }
        ctx.push(Phase::CrossChecks, Severity::Error, "file count",
            format!("header claims {} files, catalog holds {}", claimed, files),
            fixed);
    }

    Ok(())
}

/// Insert a pre-encoded record into the leaf where it belongs. Returns
/// `false` when the leaf has no room (node splits are beyond repair scope).
fn insert_leaf_record<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &mut BTree,
    record: &[u8],
    compare: &dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering,
) -> Result<bool> {
    let leaf = tree.descend_to_leaf(dev, &|existing| compare(existing, record))?;
    if leaf == 0 {
        return Ok(false);
    }
    let mut node = tree.read_node(dev, leaf)?;
    let mut at = node.desc.num_records as usize;
    for i in 0..node.desc.num_records as usize {
        if compare(node.record(i)?, record) == std::cmp::Ordering::Greater {
            at = i;
            break;
        }
    }
    if node.insert_record(at, record).is_err() {
        return Ok(false);
    }
    tree.write_node(dev, &node)?;
    tree.header.leaf_records += 1;
    tree.write_header(dev)?;
    Ok(true)
}

/// Delete the first leaf record matching `compare`. Returns whether a
/// record was removed.
fn delete_leaf_record<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &mut BTree,
    compare: &dyn Fn(&[u8]) -> std::cmp::Ordering,
) -> Result<bool> {
    let Some((mut node, index)) = tree.search(dev, compare)? else {
        return Ok(false);
    };
    node.remove_record(index)?;
    tree.write_node(dev, &node)?;
    tree.header.leaf_records = tree.header.leaf_records.saturating_sub(1);
    tree.write_header(dev)?;
    Ok(true)
}

/// Rewrite a file record's fork logical size in place.
fn clamp_fork_size<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    sensitive: bool,
    cnid: u32,
    fork_type: u8,
    new_size: u64,
) -> Result<bool> {
    // Locate the file's forward record through its thread.
    let Some(thread) = catalog::lookup_thread(dev, tree, sensitive, cnid)? else {
        return Ok(false);
    };
    let target = catalog::CatalogKey { parent_id: thread.parent_id, node_name: thread.node_name };
    let hit = tree.search(dev, &|record| match catalog::parse_catalog_key(record) {
        Ok((key, _)) => key.compare(&target, sensitive),
        Err(_) => std::cmp::Ordering::Less,
    })?;
    let Some((mut node, index)) = hit else {
        return Ok(false);
    };

    let record_start = node.offsets[index] as usize;
    let record = node.record(index)?;
    let (_, payload) = catalog::parse_catalog_key(record)?;
    // Fork data sits at a fixed offset inside a file record payload: the
    // data fork at 88, the resource fork at 168.
    let fork_at = payload + if fork_type == FORK_TYPE_DATA { 88 } else { 168 };
    if record.len() < fork_at + 8 {
        return Ok(false);
    }
    let absolute = record_start + fork_at;
    BigEndian::write_u64(&mut node.data[absolute..], new_size);
    tree.write_node(dev, &node)?;
    Ok(true)
}

// ── HFS ──────────────────────────────────────────────────────────────────

fn check_hfs<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
) -> Result<CheckSummary> {
    let mut header_dirty = false;
    let mut abort = false;

    // Phase 1: MDB.
    let mut primary_buf = vec![0u8; 512];
    dev.read_at(1024, &mut primary_buf)?;
    let mut mdb = match Mdb::decode(&primary_buf) {
        Ok(mdb) => mdb,
        Err(primary_err) => {
            let mut alt_buf = vec![0u8; 512];
            dev.read_at(dev.size() - 1024, &mut alt_buf)?;
            let alt = Mdb::decode(&alt_buf).map_err(|_| HfsError::BothHeadersCorrupt)?;
            let fixed = ctx.want_fix("Restore the MDB from the alternate copy");
            if fixed {
                dev.write_at(1024, &alt_buf)?;
                dev.sync()?;
            }
            ctx.push(Phase::Header, Severity::Error, "offset 1024",
                format!("primary MDB unusable ({}); alternate copy is sound", primary_err),
                fixed);
            alt
        }
    };

    let now = now_hfs();
    for (field, value) in [("create date", mdb.create_date), ("modify date", mdb.modify_date)] {
        if value > now {
            let fixed = ctx.want_fix(&format!("Clamp {} to the current time", field));
            if fixed {
                if field == "create date" {
                    mdb.create_date = now;
                } else {
                    mdb.modify_date = now;
                }
                header_dirty = true;
            }
            ctx.push(Phase::Header, Severity::Warn, field,
                format!("{} is in the future (Y2K40 hazard)", field), fixed);
        }
    }

    // Open trees.
    let mut extents_tree = None;
    let mut catalog_tree = None;
    match BTree::open(dev, ForkMap::from_hfs(&mdb.extents_file_extents, mdb.alloc_block_size, mdb.alloc_start)) {
        Ok(tree) => extents_tree = Some(tree),
        Err(e) => {
            ctx.push(Phase::ExtentsTree, Severity::Critical, "header node",
                format!("extents tree unusable: {}", e), false);
            abort = true;
        }
    }
    match BTree::open(dev, ForkMap::from_hfs(&mdb.catalog_file_extents, mdb.alloc_block_size, mdb.alloc_start)) {
        Ok(tree) => catalog_tree = Some(tree),
        Err(e) => {
            ctx.push(Phase::CatalogTree, Severity::Critical, "header node",
                format!("catalog tree unusable: {}", e), false);
            abort = true;
        }
    }

    // Phase 2: allocation bitmap.
    if !abort && !ctx.interrupted() {
        let extents_tree = extents_tree.as_ref().unwrap();
        let catalog_tree = catalog_tree.as_ref().unwrap();
        abort = hfs_bitmap_phase(dev, ctx, &mut mdb, extents_tree, catalog_tree, &mut header_dirty)?;
    }

    // Phases 3-4: tree structure.
    if !abort && !ctx.interrupted() {
        if let Some(tree) = extents_tree.as_mut() {
            let critical = tree_phase(dev, ctx, Phase::ExtentsTree, tree, 512,
                &extents::compare_hfs_extent_records)?;
            abort = abort || critical;
        }
        if let Some(tree) = catalog_tree.as_mut() {
            let critical = tree_phase(dev, ctx, Phase::CatalogTree, tree, 512,
                &catalog::compare_hfs_catalog_records)?;
            abort = abort || critical;
        }
    }

    // Phase 5: catalog cross-checks.
    if !abort && !ctx.interrupted() {
        let extents_tree = extents_tree.as_ref().unwrap();
        let catalog_tree = catalog_tree.as_mut().unwrap();
        hfs_cross_checks(dev, ctx, &mut mdb, extents_tree, catalog_tree, &mut header_dirty)?;
    }

    let cancelled = ctx.interrupted();

    // Finalize.
    if (ctx.repaired || header_dirty) && ctx.options.mode != RepairMode::ReadOnly && !cancelled {
        mdb.write_count = mdb.write_count.wrapping_add(1);
        let mut sector = vec![0u8; 512];
        mdb.encode(&mut sector);
        dev.write_at(1024, &sector)?;
        dev.sync()?;
        dev.write_at(dev.size() - 1024, &sector)?;
        dev.sync()?;
        ctx.repaired = true;
    }

    Ok(ctx.take_summary(cancelled))
}

fn hfs_bitmap_phase<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    mdb: &mut Mdb,
    extents_tree: &BTree,
    catalog_tree: &BTree,
    header_dirty: &mut bool,
) -> Result<bool> {
    let total = mdb.total_blocks as u32;
    let mut expected = Bitmap::new(total);
    let mut double_claims: Vec<u32> = Vec::new();
    let mut out_of_range: Vec<String> = Vec::new();

    {
        let mut claim = |owner: &str, start: u32, count: u32| {
            let end = start.saturating_add(count);
            if end > total {
                out_of_range.push(format!(
                    "{}: extent {}+{} runs past block {}",
                    owner, start, count, total
                ));
            }
            for b in start..end.min(total) {
                if expected.claim(b) {
                    double_claims.push(b);
                }
            }
        };

        // System files. One bit per allocation block; the boot blocks, MDB
        // and bitmap sectors live outside the allocation area entirely.
        for (owner, cnid, rec, size) in [
            ("extents file", CNID_EXTENTS_FILE, &mdb.extents_file_extents, mdb.extents_file_size),
            ("catalog file", CNID_CATALOG_FILE, &mdb.catalog_file_extents, mdb.catalog_file_size),
        ] {
            let inline: Vec<crate::volume::ExtentDescriptor> = rec
                .iter()
                .map(|e| crate::volume::ExtentDescriptor {
                    start_block: e.start_block as u32,
                    block_count: e.block_count as u32,
                })
                .collect();
            let needed = ((size + mdb.alloc_block_size - 1) / mdb.alloc_block_size) as u64;
            extents::walk_fork_extents(
                dev, extents_tree, false, cnid, FORK_TYPE_DATA, &inline, needed,
                |start, count| claim(owner, start, count),
            )?;
        }

        // User files from the catalog.
        let mut forks: Vec<(u32, u8, Vec<crate::volume::ExtentDescriptor>, u64)> = Vec::new();
        let walk = catalog_tree.walk_leaves(dev, |_, _, record| {
            if let Ok((_, payload)) = catalog::parse_hfs_catalog_key(record) {
                if let Ok(HfsCatalogRecord::File(file)) =
                    catalog::parse_hfs_catalog_record(&record[payload..])
                {
                    for (fork_type, extents_rec, physical) in [
                        (FORK_TYPE_DATA, &file.data_extents, file.data_physical_size),
                        (FORK_TYPE_RESOURCE, &file.rsrc_extents, file.rsrc_physical_size),
                    ] {
                        let inline: Vec<crate::volume::ExtentDescriptor> = extents_rec
                            .iter()
                            .map(|e| crate::volume::ExtentDescriptor {
                                start_block: e.start_block as u32,
                                block_count: e.block_count as u32,
                            })
                            .collect();
                        let needed =
                            (physical as u64 + mdb.alloc_block_size as u64 - 1) / mdb.alloc_block_size as u64;
                        forks.push((file.file_id, fork_type, inline, needed));
                    }
                }
            }
            Ok(true)
        });
        if let Err(e) = walk {
            ctx.push(Phase::Bitmap, Severity::Warn, "catalog",
                format!("catalog walk incomplete during bitmap accumulation: {}", e), false);
        }
        for (cnid, fork_type, inline, needed) in forks {
            let owner = format!("file {}", cnid);
            extents::walk_fork_extents(
                dev, extents_tree, false, cnid, fork_type, &inline, needed,
                |start, count| claim(&owner, start, count),
            )?;
        }
    }

    for message in out_of_range {
        ctx.push(Phase::Bitmap, Severity::Error, "extents", message, false);
    }
    if !double_claims.is_empty() {
        double_claims.sort_unstable();
        double_claims.dedup();
        ctx.push(Phase::Bitmap, Severity::Critical, "allocation",
            format!("{} block(s) claimed by more than one owner (first: {})",
                double_claims.len(), double_claims[0]),
            false);
        if ctx.options.mode != RepairMode::ReadOnly {
            return Ok(true);
        }
    }

    // On-disk bitmap: sectors starting at drVBMSt.
    let bitmap_len = Bitmap::byte_len(total);
    let bitmap_sectors = (bitmap_len as u64 + 511) / 512;
    let vbm_map = ForkMap::from_range(mdb.bitmap_start as u64 * 512, bitmap_sectors * 512);
    let mut disk_bytes = vec![0u8; bitmap_len];
    vbm_map.read_exact(dev, 0, &mut disk_bytes)?;
    let disk = Bitmap::from_bytes(disk_bytes, total);

    let orphans = disk.orphans(&expected);
    let missing = disk.missing(&expected);
    let mut bitmap_rewritten = false;

    if !orphans.is_empty() {
        let fixed = ctx.want_fix("Free blocks that are marked used but have no owner");
        if fixed {
            bitmap_rewritten = true;
        }
        ctx.push(Phase::Bitmap, Severity::Warn, "allocation",
            format!("{} block(s) marked used but unowned (first: {})", orphans.len(), orphans[0]),
            fixed);
    }
    if !missing.is_empty() {
        let fixed = ctx.want_fix("Mark allocated blocks as used in the bitmap");
        if fixed {
            bitmap_rewritten = true;
        }
        ctx.push(Phase::Bitmap, Severity::Error, "allocation",
            format!("{} allocated block(s) not marked used (first: {})", missing.len(), missing[0]),
            fixed);
    }
    if bitmap_rewritten {
        vbm_map.write_all(dev, 0, expected.as_bytes())?;
        dev.sync()?;
    }

    let counted = if bitmap_rewritten { expected.count_free() } else { disk.count_free() };
    if counted != mdb.free_blocks as u32 {
        let claimed = mdb.free_blocks;
        let fixed = ctx.want_fix("Overwrite the MDB free-block count with the counted value");
        if fixed {
            mdb.free_blocks = counted as u16;
            *header_dirty = true;
        }
        ctx.push(Phase::Bitmap, Severity::Error, "free blocks",
            format!("MDB claims {} free blocks, bitmap counts {}", claimed, counted),
            fixed);
    }

    Ok(false)
}

fn hfs_cross_checks<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    ctx: &mut CheckContext,
    mdb: &mut Mdb,
    extents_tree: &BTree,
    catalog_tree: &mut BTree,
    header_dirty: &mut bool,
) -> Result<()> {
    let mut files: u32 = 0;
    let mut dirs: u32 = 0;
    let mut forward: HashMap<u32, (u32, Vec<u8>, bool)> = HashMap::new();
    let mut threads: HashMap<u32, (u32, Vec<u8>)> = HashMap::new();
    let mut fork_checks: Vec<(u32, u8, Vec<crate::volume::ExtentDescriptor>, u32, u32)> = Vec::new();

    let walk = catalog_tree.walk_leaves(dev, |_, _, record| {
        let Ok((key, payload)) = catalog::parse_hfs_catalog_key(record) else {
            return Ok(true);
        };
        match catalog::parse_hfs_catalog_record(&record[payload..]) {
            Ok(HfsCatalogRecord::Dir(dir)) => {
                dirs += 1;
                forward.insert(dir.dir_id, (key.parent_id, key.name.clone(), true));
            }
            Ok(HfsCatalogRecord::File(file)) => {
                files += 1;
                forward.insert(file.file_id, (key.parent_id, key.name.clone(), false));
                for (fork_type, rec, logical, physical) in [
                    (FORK_TYPE_DATA, &file.data_extents, file.data_logical_size, file.data_physical_size),
                    (FORK_TYPE_RESOURCE, &file.rsrc_extents, file.rsrc_logical_size, file.rsrc_physical_size),
                ] {
                    let inline: Vec<crate::volume::ExtentDescriptor> = rec
                        .iter()
                        .map(|e| crate::volume::ExtentDescriptor {
                            start_block: e.start_block as u32,
                            block_count: e.block_count as u32,
                        })
                        .collect();
                    fork_checks.push((file.file_id, fork_type, inline, logical, physical));
                }
            }
            Ok(HfsCatalogRecord::DirThread(t)) | Ok(HfsCatalogRecord::FileThread(t)) => {
                threads.insert(key.parent_id, (t.parent_id, t.name));
            }
            Err(_) => {}
        }
        Ok(true)
    });
    if let Err(e) = walk {
        ctx.push(Phase::CrossChecks, Severity::Error, "catalog",
            format!("catalog walk failed: {}", e), false);
        return Ok(());
    }

    // Directories must have threads; classic HFS makes file threads
    // optional, so a missing one is only noted.
    let mut forward_cnids: Vec<u32> = forward.keys().copied().collect();
    forward_cnids.sort_unstable();
    for cnid in forward_cnids {
        let (parent, name, is_dir) = forward[&cnid].clone();
        if threads.contains_key(&cnid) {
            continue;
        }
        if !is_dir {
            ctx.push(Phase::CrossChecks, Severity::Warn, &format!("CNID {}", cnid),
                "file record has no thread record".into(), false);
            continue;
        }
        let fixed = ctx.want_fix("Synthesize the missing directory thread record");
        let mut applied = false;
        if fixed {
            let mut record = catalog::encode_hfs_catalog_key(cnid, b"");
            record.extend_from_slice(&catalog::encode_hfs_thread_record(true, parent, &name));
            applied = insert_leaf_record(dev, catalog_tree, &record,
                &catalog::compare_hfs_catalog_records)?;
            if !applied {
                ctx.push(Phase::CrossChecks, Severity::Warn, &format!("CNID {}", cnid),
                    "no room in the leaf node for a synthesized thread".into(), false);
            }
        }
        ctx.push(Phase::CrossChecks, Severity::Error, &format!("CNID {}", cnid),
            "directory record has no thread record".into(), applied);
    }

    let mut thread_cnids: Vec<u32> = threads.keys().copied().collect();
    thread_cnids.sort_unstable();
    for cnid in thread_cnids {
        if forward.contains_key(&cnid) {
            continue;
        }
        let fixed = ctx.want_fix("Delete the orphan thread record");
        let mut applied = false;
        if fixed {
            let target = catalog::HfsCatalogKey { parent_id: cnid, name: vec![] };
            applied = delete_leaf_record(dev, catalog_tree, &|record| {
                match catalog::parse_hfs_catalog_key(record) {
                    Ok((key, _)) => key.compare(&target),
                    Err(_) => std::cmp::Ordering::Less,
                }
            })?;
        }
        ctx.push(Phase::CrossChecks, Severity::Error, &format!("CNID {}", cnid),
            "thread record has no matching file or directory record".into(), applied);
    }

    // Fork accounting against the extents overflow tree.
    for (cnid, fork_type, inline, logical, physical) in fork_checks {
        if logical == 0 && physical == 0 {
            continue;
        }
        let needed =
            (physical as u64 + mdb.alloc_block_size as u64 - 1) / mdb.alloc_block_size as u64;
        let allocated = extents::walk_fork_extents(
            dev, extents_tree, false, cnid, fork_type, &inline, needed, |_, _| {},
        )?;
        if allocated < needed || (logical as u64) > needed * mdb.alloc_block_size as u64 {
            ctx.push(Phase::CrossChecks, Severity::Error, &format!("CNID {}", cnid),
                format!(
                    "{} fork sizes disagree: logical {}, physical {}, allocated {} block(s)",
                    if fork_type == FORK_TYPE_DATA { "data" } else { "resource" },
                    logical, physical, allocated
                ),
                false);
        }
    }

    // Counts. drDirCnt includes the root directory.
    if mdb.folder_count != dirs {
        let claimed = mdb.folder_count;
        let fixed = ctx.want_fix("Overwrite the MDB directory count");
        if fixed {
            mdb.folder_count = dirs;
            *header_dirty = true;
        }
        ctx.push(Phase::CrossChecks, Severity::Error, "directory count",
            format!("MDB claims {} directories, catalog holds {}", claimed, dirs),
            fixed);
    }
    if mdb.file_count != files {
        let claimed = mdb.file_count;
        let fixed = ctx.want_fix("Overwrite the MDB file count");
        if fixed {
            mdb.file_count = files;
            *header_dirty = true;
        }
        ctx.push(Phase::CrossChecks, Severity::Error, "file count",
            format!("MDB claims {} files, catalog holds {}", claimed, files),
            fixed);
    }

    // Root-folder valence sanity: every record whose parent is the root.
    let root_children = forward
        .values()
        .filter(|(parent, _, _)| *parent == CNID_ROOT_FOLDER)
        .count() as u32;
    let claimed = mdb.root_file_count as u32 + mdb.root_dir_count as u32;
    if claimed != root_children {
        ctx.push(Phase::CrossChecks, Severity::Warn, "root valence",
            format!("MDB claims {} root entries, catalog holds {}", claimed, root_children),
            false);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{format_hfs, format_hfsplus, PlusFormatOptions};
    use std::io::Cursor;

    fn blank(size: usize) -> BlockDevice<Cursor<Vec<u8>>> {
        BlockDevice::new(Cursor::new(vec![0u8; size])).unwrap()
    }

    fn run(dev: &mut BlockDevice<Cursor<Vec<u8>>>, mode: RepairMode) -> CheckSummary {
        let options = CheckOptions { mode, ..Default::default() };
        let mut prompt = AssumeYes;
        let mut ctx = CheckContext::new(options, &mut prompt);
        check_volume(dev, &mut ctx).unwrap()
    }

    #[test]
    fn test_fresh_hfs_volume_is_clean() {
        let mut dev = blank(4 * 1024 * 1024);
        format_hfs(&mut dev, "Test").unwrap();
        let summary = run(&mut dev, RepairMode::ReadOnly);
        for f in &summary.findings {
            assert!(f.severity < Severity::Error, "unexpected finding: {}", f);
        }
        assert_eq!(summary.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_fresh_hfsplus_volume_is_clean() {
        let mut dev = blank(16 * 1024 * 1024);
        format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();
        let summary = run(&mut dev, RepairMode::ReadOnly);
        for f in &summary.findings {
            assert!(f.severity < Severity::Error, "unexpected finding: {}", f);
        }
        assert_eq!(summary.exit_code(), EXIT_OK);
    }

    #[test]
    fn test_fresh_journaled_volume_is_clean() {
        let mut dev = blank(32 * 1024 * 1024);
        let options = PlusFormatOptions { journaled: true, ..Default::default() };
        format_hfsplus(&mut dev, &options).unwrap();
        assert_eq!(run(&mut dev, RepairMode::ReadOnly).exit_code(), EXIT_OK);
    }

    #[test]
    fn test_corrupt_free_blocks_corrected_then_clean() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();

        // Stamp freeBlocks to zero in both header copies.
        let mut broken = vh.clone();
        broken.free_blocks = 0;
        volume::write_both(&mut dev, &broken).unwrap();

        let summary = run(&mut dev, RepairMode::Auto);
        assert_eq!(summary.exit_code(), EXIT_CORRECTED);

        let fixed = volume::read_primary(&mut dev).unwrap();
        assert_eq!(fixed.free_blocks, vh.free_blocks);

        // A second run is clean, and both copies agree byte for byte.
        assert_eq!(run(&mut dev, RepairMode::Auto).exit_code(), EXIT_OK);
        let primary = volume::read_primary(&mut dev).unwrap();
        let alternate = volume::read_alternate(&mut dev).unwrap();
        assert_eq!(primary, alternate);
    }

    #[test]
    fn test_read_only_reports_but_never_writes() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();
        let mut broken = vh.clone();
        broken.free_blocks = 7;
        volume::write_both(&mut dev, &broken).unwrap();

        let summary = run(&mut dev, RepairMode::ReadOnly);
        assert_eq!(summary.exit_code(), EXIT_UNCORRECTED);
        assert_eq!(volume::read_primary(&mut dev).unwrap().free_blocks, 7);
    }

    #[test]
    fn test_clean_run_leaves_dirty_bit_and_write_count_alone() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();
        run(&mut dev, RepairMode::Auto);
        let after = volume::read_primary(&mut dev).unwrap();
        assert_eq!(after.write_count, vh.write_count);
        assert_eq!(after.attributes, vh.attributes);
    }

    #[test]
    fn test_out_of_order_catalog_keys_detected() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();

        // Swap the two leaf records of the fresh catalog so keys descend.
        let tree = BTree::open(
            &mut dev,
            ForkMap::from_fork(&vh.catalog_file, vh.block_size),
        )
        .unwrap();
        let node = tree.read_node(&mut dev, 1).unwrap();
        let rec0 = node.record(0).unwrap().to_vec();
        let rec1 = node.record(1).unwrap().to_vec();
        let swapped = btree::build_leaf_node(
            tree.header.node_size as usize, 0, 0, &[rec1, rec0],
        );
        tree.write_node_raw(&mut dev, 1, &swapped).unwrap();

        let summary = run(&mut dev, RepairMode::ReadOnly);
        assert_eq!(summary.exit_code(), EXIT_UNCORRECTED);
        assert!(summary
            .findings
            .iter()
            .any(|f| f.description.contains("out of order")));
    }

    #[test]
    fn test_journal_replay_during_check() {
        let mut dev = blank(32 * 1024 * 1024);
        let options = PlusFormatOptions { journaled: true, ..Default::default() };
        let vh = format_hfsplus(&mut dev, &options).unwrap();

        // Append one transaction rewriting a free data block.
        let mut j = journal::validate(&mut dev, &vh).unwrap();
        let target = (vh.next_allocation + 10) as u64;
        let payload = vec![0xEEu8; vh.block_size as usize];

        let tx_start = j.header.end;
        let bi_at = tx_start + journal::BLOCK_LIST_HEADER_SIZE as u64;
        let payload_at = bi_at + journal::BLOCK_INFO_SIZE as u64;
        let tx_end = payload_at + payload.len() as u64;

        let mut blh = journal::BlockListHeader { bsize: 0x1000, num_blocks: 1, checksum: 0 };
        blh.seal();
        dev.write_at(j.base + tx_start, &blh.encode()).unwrap();
        let bi = journal::BlockInfo { bnum: target, bsize: payload.len() as u32, next: tx_end };
        dev.write_at(j.base + bi_at, &bi.encode()).unwrap();
        dev.write_at(j.base + payload_at, &payload).unwrap();

        j.header.end = tx_end;
        j.header.seal();
        dev.write_at(j.base, &j.header.encode()).unwrap();

        let summary = run(&mut dev, RepairMode::Auto);
        assert_eq!(summary.exit_code(), EXIT_CORRECTED);

        let mut block = vec![0u8; vh.block_size as usize];
        dev.read_at(target * vh.block_size as u64, &mut block).unwrap();
        assert_eq!(block, payload);

        let primary_after = volume::read_primary(&mut dev).unwrap();
        let j_after = journal::validate(&mut dev, &primary_after).unwrap();
        assert!(j_after.is_clean());
        assert_eq!(j_after.header.start, tx_end);
    }

    #[test]
    fn test_primary_header_restored_from_alternate() {
        let mut dev = blank(16 * 1024 * 1024);
        let vh = format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();

        // Trash the primary header.
        dev.write_at(VOLUME_HEADER_OFFSET, &[0u8; 512]).unwrap();

        let summary = run(&mut dev, RepairMode::Auto);
        assert_eq!(summary.exit_code(), EXIT_CORRECTED);
        let restored = volume::read_primary(&mut dev).unwrap();
        assert_eq!(restored.total_blocks, vh.total_blocks);
    }

    #[test]
    fn test_both_headers_gone_is_operational() {
        let mut dev = blank(16 * 1024 * 1024);
        format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();
        dev.write_at(VOLUME_HEADER_OFFSET, &[0u8; 512]).unwrap();
        let size = dev.size();
        dev.write_at(size - 1024, &[0u8; 512]).unwrap();

        let options = CheckOptions { mode: RepairMode::Auto, ..Default::default() };
        let mut prompt = AssumeYes;
        let mut ctx = CheckContext::new(options, &mut prompt);
        assert!(check_volume(&mut dev, &mut ctx).is_err());
    }

    #[test]
    fn test_hfs_free_block_mismatch_corrected() {
        let mut dev = blank(4 * 1024 * 1024);
        let mdb = format_hfs(&mut dev, "Counts").unwrap();

        let mut broken = mdb.clone();
        broken.free_blocks = 1;
        let mut sector = vec![0u8; 512];
        broken.encode(&mut sector);
        dev.write_at(1024, &sector).unwrap();
        let size = dev.size();
        dev.write_at(size - 1024, &sector).unwrap();

        let summary = run(&mut dev, RepairMode::Auto);
        assert_eq!(summary.exit_code(), EXIT_CORRECTED);

        let mut buf = vec![0u8; 512];
        dev.read_at(1024, &mut buf).unwrap();
        assert_eq!(Mdb::decode(&buf).unwrap().free_blocks, mdb.free_blocks);
        assert_eq!(run(&mut dev, RepairMode::Auto).exit_code(), EXIT_OK);
    }

    #[test]
    fn test_interrupt_cancels_between_phases() {
        let mut dev = blank(16 * 1024 * 1024);
        format_hfsplus(&mut dev, &PlusFormatOptions::default()).unwrap();

        let options = CheckOptions { mode: RepairMode::ReadOnly, ..Default::default() };
        let mut prompt = AssumeNo;
        let mut ctx = CheckContext::new(options, &mut prompt);
        ctx.interrupt_flag().store(true, AtomicOrdering::Relaxed);
        let summary = check_volume(&mut dev, &mut ctx).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.exit_code(), EXIT_CANCELLED);
    }
}
