use serde::Serialize;
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Serialize)]
pub struct BenchBudget {
    pub name: &'static str,
    pub budget: &'static str,
}

#[derive(Serialize)]
struct BenchMetadata<'a> {
    test_type: &'static str,
    bench: &'a str,
    generated_at_ms: u64,
    blockwatch_version: &'static str,
    os: &'static str,
    arch: &'static str,
    budgets: &'a [BenchBudget],
}

const META_PATH: &str = "target/criterion/blockwatch-bench-meta.jsonl";

/// Print and append a metadata line describing this bench run.
pub fn emit_bench_metadata(bench: &str, budgets: &[BenchBudget]) {
    let metadata = BenchMetadata {
        test_type: "bench",
        bench,
        generated_at_ms: now_ms(),
        blockwatch_version: env!("CARGO_PKG_VERSION"),
        os: env::consts::OS,
        arch: env::consts::ARCH,
        budgets,
    };

    if let Ok(line) = serde_json::to_string(&metadata) {
        println!("[BENCH] {line}");
        let _ = append_jsonl(META_PATH, &line);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or_default()
}

fn append_jsonl(path: &str, line: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
