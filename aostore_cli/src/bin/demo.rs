//! Column-oriented append-only table demo
//!
//! Builds a small request-log table in a temporary directory, inserts a few
//! tens of thousands of rows, then shows the three ways of reading it back:
//! a filtered sequential scan, random fetches by tuple id, and a scan after
//! some rows were hidden through the visibility map.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use aostore_codecs::BundledCodecs;
use aostore_core::aocs::{
    AocsFetch, AocsHeaderScan, AocsInsert, AocsScan, AocsServices, ColumnDesc, ColumnType, ScanFilter,
    ScanOptions, SegmentFileInfo, TableDesc, TupleId, Value,
};
use aostore_core::CompressionKind;

// ── constants ──────────────────────────────────────────────────────────────

const ROWS: i64 = 50_000;
const SEGNO: u32 = 1;
const STATUSES: &[&str] = &["200", "200", "200", "304", "200", "404", "200", "500"];
const PATHS: &[&str] = &[
    "/api/v1/catalog/items",
    "/api/v1/orders/status",
    "/api/v1/users/profile",
    "/api/v1/cart/items",
    "/health",
];

// ── data generator ─────────────────────────────────────────────────────────

/// Deterministic row `i`: id, path, status, latency, cache hit.
fn generate_row(i: i64) -> Vec<Option<Value>> {
    let n = i as usize;
    let status = STATUSES[(n * 5 + 2) % STATUSES.len()];
    let latency = ((i * 137 + 42) % 900 + 10) as f64 / 100.0;
    // every 97th request has no recorded latency
    let latency = if i % 97 == 0 { None } else { Some(Value::Float64(latency)) };
    vec![
        Some(Value::Int64(i)),
        Some(Value::Text(PATHS[(n * 11 + 5) % PATHS.len()].to_string())),
        Some(Value::Text(status.to_string())),
        latency,
        // long runs of the same flag
        Some(Value::Bool((i / 500) % 3 == 0)),
    ]
}

fn request_table() -> TableDesc {
    TableDesc::new(
        "requests",
        16384,
        vec![
            ColumnDesc::new("id", ColumnType::Int64),
            ColumnDesc::new("path", ColumnType::Text).compressed(CompressionKind::Zstd, 3),
            ColumnDesc::new("status", ColumnType::Text).compressed(CompressionKind::Lz4, 1),
            ColumnDesc::new("latency_ms", ColumnType::Float64).compressed(CompressionKind::Zlib, 6),
            ColumnDesc::new("cache_hit", ColumnType::Bool).run_length(),
        ],
    )
}

// ── formatting ─────────────────────────────────────────────────────────────

fn human_bytes(n: u64) -> String {
    const U: &[&str] = &["B", "KB", "MB", "GB"];
    let mut v = n as f64;
    let mut u = 0;
    while v >= 1024.0 && u < U.len() - 1 {
        v /= 1024.0;
        u += 1;
    }
    if u == 0 {
        format!("{n} B")
    } else {
        format!("{v:.2} {}", U[u])
    }
}

fn fmt_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        format!("{:.1} µs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{ms:.1} ms")
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}

// ── demo runner ────────────────────────────────────────────────────────────

fn run() -> Result<()> {
    let dir = tempfile::tempdir().context("creating table directory")?;
    let table = request_table();
    let services = AocsServices::in_memory(Some(Arc::new(BundledCodecs)));

    println!();
    println!("  Column-oriented append-only table '{}' in {:?}", table.name, dir.path());
    println!();

    // insert
    let t0 = Instant::now();
    let segment = SegmentFileInfo::new(SEGNO, table.columns.len())?;
    let mut insert = AocsInsert::open(&table, dir.path(), segment, services.clone())?;
    let mut tids: Vec<TupleId> = Vec::with_capacity(ROWS as usize);
    for i in 0..ROWS {
        tids.push(insert.insert(&generate_row(i))?);
    }
    let outcome = insert.finish()?;
    let segment = outcome.segment;
    println!("  Inserted {} rows in {}", outcome.rows_inserted, fmt_duration(t0.elapsed()));
    println!();
    println!(
        "  {:<12}  {:>7}  {:>10}  {:>12}  {:>12}  {:>7}",
        "column", "blocks", "compressed", "eof", "uncompressed", "writes"
    );
    println!("  {}", "─".repeat(70));
    for (i, (desc, stats)) in table.columns.iter().zip(&outcome.column_stats).enumerate() {
        let eof = segment.column_eof(i)?;
        println!(
            "  {:<12}  {:>7}  {:>10}  {:>12}  {:>12}  {:>7}",
            desc.name,
            stats.blocks,
            stats.compressed_blocks,
            human_bytes(eof.eof),
            human_bytes(eof.eof_uncompressed),
            stats.physical_writes
        );
    }
    println!();

    // headers of one column
    let mut headers = AocsHeaderScan::open(&table, dir.path(), &segment, 2)?;
    let mut first = Vec::new();
    while let Some(block) = headers.next_header()? {
        if first.len() < 3 {
            first.push(block);
        }
    }
    headers.finish();
    println!("  First blocks of column 'status':");
    for block in &first {
        println!(
            "    offset {:>8}  {:<22}  rows {:>6}  first row {:>6}  stored {:>6}",
            block.header_offset,
            block.info.kind.name(),
            block.info.row_count,
            block.first_row_num,
            block.info.stored_len()
        );
    }
    println!();

    // filtered scan
    let segments = vec![segment.clone()];
    let filters = vec![
        ScanFilter::new(1, |v| matches!(v, Some(Value::Text(p)) if p.starts_with("/api"))),
        ScanFilter::new(2, |v| matches!(v, Some(Value::Text(s)) if s == "500")),
    ];
    let t0 = Instant::now();
    let mut scan = AocsScan::new(
        &table,
        dir.path(),
        segments.clone(),
        &[0, 3],
        filters,
        ScanOptions::default(),
        &services,
    )?;
    let mut errors = 0u64;
    let mut slowest: Option<(i64, f64)> = None;
    while let Some(row) = scan.next_row()? {
        errors += 1;
        if let (Some(Value::Int64(id)), Some(Value::Float64(ms))) = (&row.values[0], &row.values[1]) {
            if slowest.map_or(true, |(_, best)| *ms > best) {
                slowest = Some((*id, *ms));
            }
        }
    }
    let order = scan.read_order();
    let stats = scan.stats();
    scan.finish();
    println!("  Scan: /api requests with status 500  →  {} rows in {}", errors, fmt_duration(t0.elapsed()));
    println!("    column read order after sampling : {:?}", order);
    println!(
        "    rows filtered {}  blocks read {}  decompressed {}",
        stats.rows_filtered, stats.blocks_read, stats.blocks_decompressed
    );
    if let Some((id, ms)) = slowest {
        println!("    slowest failing request          : id {} ({:.2} ms)", id, ms);
    }
    println!();

    // random fetches
    let mut fetch = AocsFetch::new(&table, dir.path(), &segments, &[0, 1, 2], &services)?;
    let t0 = Instant::now();
    let mut rng = 0x2545_f491_4f6c_dd1du64;
    for _ in 0..1000 {
        rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let tid = tids[(rng >> 33) as usize % tids.len()];
        fetch.fetch(tid)?.with_context(|| format!("row {} vanished", tid))?;
    }
    let sample = fetch.fetch(tids[12_345])?;
    let fstats = fetch.stats();
    fetch.finish();
    println!("  Fetch: 1000 random tuple ids in {}", fmt_duration(t0.elapsed()));
    println!(
        "    found {}  cached values {}  physical reads {}",
        fstats.found, fstats.cached_values, fstats.physical_reads
    );
    if let Some(row) = sample {
        let shown: Vec<String> = row
            .iter()
            .map(|v| v.as_ref().map_or_else(|| "NULL".to_string(), |v| v.to_string()))
            .collect();
        println!("    {} = ({})", tids[12_345], shown.join(", "));
    }
    println!();

    // hide every 10th row and count again
    for tid in tids.iter().step_by(10) {
        services.visibility_map.hide(*tid)?;
    }
    let mut scan = AocsScan::new(
        &table,
        dir.path(),
        segments,
        &[0],
        Vec::new(),
        ScanOptions::default(),
        &services,
    )?;
    let mut visible = 0u64;
    for row in scan.by_ref() {
        row?;
        visible += 1;
    }
    let stats = scan.stats();
    scan.finish();
    println!(
        "  After hiding every 10th row: {} visible, {} skipped as invisible",
        visible, stats.rows_invisible
    );
    println!();
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
