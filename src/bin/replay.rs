//! `targets_replay` — a small CLI that drives a director `targets.json`
//! manifest through [`uptane_targets::process_targets`] and prints the
//! result, for manual testing and CI smoke runs.
//!
//! `getopts` for argument parsing, `env_logger` wired to `RUST_LOG`, and a
//! `build_config`-style helper that turns parsed options into the
//! library's own `Config` type.

use std::fs::File;
use std::process;

use getopts::Options;

use uptane_targets::{Config, ContextSource, ProcessResult, ReaderSource, RingCrypto, TargetsContext};

const MAX_SIGS: usize = 8;
const BUF_SIZE: usize = 128;

type Ctx = TargetsContext<ReaderSource<File>, RingCrypto, MAX_SIGS, BUF_SIZE>;

/// Acquiring the context through [`ContextSource`] rather than constructing
/// it inline lets the `pooled`/`heap` feature choice actually govern how the
/// context is stored, the way a long-running ECU client that parses many
/// manifests over its lifetime would use it. This binary only ever parses
/// one manifest per run, so the pooled mode needs just one slot.
#[cfg(feature = "pooled")]
type Source = uptane_targets::StaticPool<Ctx, 1>;
#[cfg(feature = "heap")]
type Source = uptane_targets::HeapSource<Ctx>;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let program = args[0].clone();
    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu then quit");
    opts.optopt("c", "config", "path to the TOML config file", "PATH");
    opts.optopt("m", "manifest", "path to the targets.json manifest", "PATH");
    opts.optopt("", "now", "current time as YYYY-MM-DDTHH:MM:SSZ", "TIMESTAMP");

    let matches = opts.parse(&args[1..]).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(2);
    });

    if matches.opt_present("h") {
        print_usage(&program, &opts);
        return;
    }

    let config_path = matches.opt_str("c").unwrap_or_else(|| {
        eprintln!("missing required --config PATH");
        process::exit(2);
    });
    let manifest_path = matches.opt_str("m").unwrap_or_else(|| {
        eprintln!("missing required --manifest PATH");
        process::exit(2);
    });
    let now_str = matches.opt_str("now").unwrap_or_else(|| {
        eprintln!("missing required --now TIMESTAMP");
        process::exit(2);
    });

    let now = match parse_calendar(&now_str) {
        Ok(t) => t,
        Err(err) => {
            eprintln!("invalid --now value: {}", err);
            process::exit(2);
        }
    };

    let config = Config::load(&config_path).unwrap_or_else(|err| {
        eprintln!("failed to load config: {}", err);
        process::exit(1);
    });

    let manifest = File::open(&manifest_path).unwrap_or_else(|err| {
        eprintln!("failed to open manifest: {}", err);
        process::exit(1);
    });

    let mut keys: [Option<([u8; 32], uptane_targets::TrustedKey)>; MAX_SIGS] = std::array::from_fn(|_| None);
    if config.keys.len() > MAX_SIGS {
        eprintln!("config has {} keys, this binary supports at most {}", config.keys.len(), MAX_SIGS);
        process::exit(1);
    }
    for (slot, key) in keys.iter_mut().zip(config.keys.iter()) {
        *slot = Some(key.clone());
    }

    let ctx: Ctx = TargetsContext::new(
        ReaderSource::new(manifest),
        RingCrypto::new(),
        keys,
        config.threshold,
        now,
        config.ecu_identifier.as_bytes(),
        config.hardware_identifier.as_bytes(),
        config.previous_version,
    )
    .unwrap_or_else(|err| {
        eprintln!("bad configuration: {}", err);
        process::exit(1);
    });

    let mut source = Source::default();
    let token = source.acquire(ctx).unwrap_or_else(|| {
        eprintln!("no context slot available");
        process::exit(1);
    });
    let slot = source.get_mut(token).expect("token just acquired");

    let result = uptane_targets::process_targets(slot);
    report(result, slot);
    source.release(token);
}

fn report<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>(
    result: ProcessResult,
    ctx: &TargetsContext<S, X, MAX_SIGS, BUF_SIZE>,
) where
    X: uptane_targets::Crypto,
{
    match result {
        ProcessResult::Update | ProcessResult::NoUpdate => {
            println!("{:?}: version={} length={} sha512={}", result, ctx.version(), ctx.length(), hex::encode(ctx.sha512()));
        }
        ProcessResult::NoHash => {
            println!("{:?}: version={} length={} (no sha512 hash)", result, ctx.version(), ctx.length());
        }
        other => {
            println!("{:?}", other);
            process::exit(1);
        }
    }
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} --config PATH --manifest PATH --now TIMESTAMP", program);
    print!("{}", opts.usage(&brief));
}

/// Parses `YYYY-MM-DDTHH:MM:SSZ` for the `--now` flag. This is plain CLI
/// argument parsing, not the streaming grammar the library implements —
/// there's no byte source to tee here, so it doesn't reuse `lexer::iso_timestamp`.
fn parse_calendar(s: &str) -> Result<uptane_targets::CalendarTime, String> {
    let bytes = s.as_bytes();
    if bytes.len() != 20 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' || bytes[13] != b':' || bytes[16] != b':' || bytes[19] != b'Z' {
        return Err("expected shape YYYY-MM-DDTHH:MM:SSZ".to_string());
    }
    let field = |range: std::ops::Range<usize>| -> Result<u32, String> {
        s.get(range).and_then(|f| f.parse().ok()).ok_or_else(|| "non-numeric field".to_string())
    };
    Ok(uptane_targets::CalendarTime::new(
        field(0..4)? as u16,
        field(5..7)? as u8,
        field(8..10)? as u8,
        field(11..13)? as u8,
        field(14..16)? as u8,
        field(17..19)? as u8,
    ))
}
