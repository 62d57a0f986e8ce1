use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use vela_attention::{
    AttentionContext, EngineConfig, GqaAttributes, GqaInputs, GroupQueryAttention, KvCacheTensors,
};
use vela_core::{BufferTag, DType, Result, Tensor};
use vela_kernels::ExecutionMode;

const BANNER: &str = r#"
__   __ _____  _       _
\ \ / /| ____|| |     / \
 \ V / |  _|  | |    / _ \
  | |  | |___ | |__ / ___ \
  |_|  |_____||_____/_/   \_\"#;

#[derive(Parser)]
#[command(
    name = "vela",
    about = "Vela attention dispatch CLI",
    long_about = "Drive the Vela attention operators on the emulated NPU.\n\nInspect the dispatch configuration, sweep sequence lengths in dry-run mode\nto collect kernel coverage, or time the accelerator path against the CPU fallback.",
    version
)]
struct Cli {
    /// Engine configuration (JSON). Defaults plus VELA_* variables when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show the engine configuration and bucket table
    Info,
    /// Run GQA in dry-run mode over a set of sequence lengths
    Sweep {
        /// Sequence lengths (comma-separated)
        #[arg(long, default_value = "1,128,300,1024,2048,2049")]
        seq: String,
        #[arg(long, default_value = "4")]
        heads: usize,
        #[arg(long, default_value = "2")]
        kv_heads: usize,
        #[arg(long, default_value = "32")]
        head_dim: usize,
        /// Print decisions and coverage as JSON
        #[arg(long)]
        json: bool,
    },
    /// Time the emulated accelerator path against the CPU fallback
    Bench {
        /// Sequence lengths (comma-separated)
        #[arg(long, default_value = "128,300,512")]
        seq: String,
        #[arg(long, default_value = "8")]
        heads: usize,
        #[arg(long, default_value = "2")]
        kv_heads: usize,
        #[arg(long, default_value = "64")]
        head_dim: usize,
        #[arg(long, default_value = "3")]
        iters: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Sweep {
            seq,
            heads,
            kv_heads,
            head_dim,
            json,
        } => cmd_sweep(config, &parse_lengths(&seq), heads, kv_heads, head_dim, json),
        Commands::Bench {
            seq,
            heads,
            kv_heads,
            head_dim,
            iters,
        } => cmd_bench(config, &parse_lengths(&seq), heads, kv_heads, head_dim, iters),
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_json_file(p),
        None => EngineConfig::from_env(),
    }
}

fn parse_lengths(s: &str) -> Vec<usize> {
    s.split(',')
        .filter_map(|v| v.trim().parse().ok())
        .filter(|&n| n > 0)
        .collect()
}

fn cmd_info(config: &EngineConfig) -> Result<()> {
    println!("{}", BANNER);
    println!("  v{}  -  NPU attention dispatch\n", env!("CARGO_PKG_VERSION"));

    println!("Configuration");
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| vela_core::VelaError::InvalidConfig(e.to_string()))?;
    for line in json.lines() {
        println!("  {}", line);
    }

    let policy = config.dispatch_policy()?;
    println!("\nBucket table (prefill, past = 0)");
    println!("{:<10} {:<12} {:>8} {:>10}", "seq", "path", "bucket", "kv_bucket");
    println!("{}", "-".repeat(43));
    let mut probes: Vec<usize> = vec![1, 2];
    for &b in policy.buckets().buckets() {
        probes.extend([b.saturating_sub(1).max(1), b, b + 1]);
    }
    probes.sort_unstable();
    probes.dedup();
    for seq in probes {
        let d = policy.decide(seq, seq);
        println!(
            "{:<10} {:<12} {:>8} {:>10}",
            seq,
            format!("{:?}", d.path),
            d.bucket_size,
            d.kv_bucket
        );
    }

    println!("\nScratch buffers (minimum bytes)");
    for tag in BufferTag::ALL {
        println!("  {:<18} {:>8}", tag.name(), tag.default_min_bytes().max(config.pool.min_bytes));
    }
    Ok(())
}

fn random_qkv(rng: &mut StdRng, seq: usize, width: usize) -> Result<Tensor> {
    let data: Vec<f32> = (0..seq * width).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Tensor::from_f32(&data, &[1, seq, width], DType::BF16)
}

fn gqa(ctx: &Arc<AttentionContext>, heads: usize, kv_heads: usize) -> Result<GroupQueryAttention> {
    GroupQueryAttention::new(
        GqaAttributes {
            num_heads: heads,
            kv_num_heads: kv_heads,
            ..Default::default()
        },
        Arc::clone(ctx),
    )
}

fn run_once(op: &mut GroupQueryAttention, qkv: &Tensor, kv_heads: usize, head_dim: usize) -> Result<Tensor> {
    let seq = qkv.dims()[1];
    let past = Tensor::from_vec(vec![0i32], &[1])?;
    let total = Tensor::scalar_i64(seq as i64);
    let mut cache = KvCacheTensors::empty(1, kv_heads, head_dim, DType::BF16)?;
    op.compute(&GqaInputs::packed(qkv, &past, &total), &mut cache)
}

fn cmd_sweep(
    mut config: EngineConfig,
    lengths: &[usize],
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    json: bool,
) -> Result<()> {
    config.execution_mode = ExecutionMode::DryRun;
    let ctx = AttentionContext::new(config)?;
    let mut op = gqa(&ctx, heads, kv_heads)?;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let width = (heads + 2 * kv_heads) * head_dim;

    let mut decisions = Vec::with_capacity(lengths.len());
    for &seq in lengths {
        let qkv = random_qkv(&mut rng, seq, width)?;
        run_once(&mut op, &qkv, kv_heads, head_dim)?;
        if let Some(d) = op.last_decision() {
            decisions.push((seq, d));
        }
    }
    let report = ctx.inventory().report();
    tracing::info!(
        "sweep finished: {} kernel invocations, {} failures",
        report.invocations,
        report.failures
    );

    if json {
        let rows: Vec<_> = decisions
            .iter()
            .map(|(seq, d)| serde_json::json!({ "seq": seq, "decision": d }))
            .collect();
        let doc = serde_json::json!({ "decisions": rows, "coverage": report });
        println!("{}", doc);
        return Ok(());
    }

    println!("=== Dry-run sweep (heads={} kv_heads={} head_dim={}) ===\n", heads, kv_heads, head_dim);
    println!("{:<8} {:<8} {:<12} {:>8} {:>10}", "seq", "phase", "path", "bucket", "kv_bucket");
    println!("{}", "-".repeat(50));
    for (seq, d) in &decisions {
        println!(
            "{:<8} {:<8} {:<12} {:>8} {:>10}",
            seq,
            format!("{:?}", d.phase),
            format!("{:?}", d.path),
            d.bucket_size,
            d.kv_bucket
        );
    }
    println!("\n{}", report);
    Ok(())
}

fn cmd_bench(
    config: EngineConfig,
    lengths: &[usize],
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    iters: usize,
) -> Result<()> {
    let iters = iters.max(1);
    let npu_ctx = AttentionContext::new(config.clone())?;
    let cpu_ctx = AttentionContext::new(EngineConfig {
        enable_accelerator: false,
        ..config
    })?;
    let mut npu = gqa(&npu_ctx, heads, kv_heads)?;
    let mut cpu = gqa(&cpu_ctx, heads, kv_heads)?;
    let mut rng = StdRng::seed_from_u64(0xbe4c);
    let width = (heads + 2 * kv_heads) * head_dim;

    println!("=== GQA Benchmark (heads={} kv_heads={} head_dim={}) ===\n", heads, kv_heads, head_dim);
    println!("{:<10} {:>8} {:>14} {:>14} {:>10}", "SeqLen", "Bucket", "Emulated (ms)", "Fallback (ms)", "Ratio");
    println!("{}", "-".repeat(60));

    for &seq in lengths {
        let qkv = random_qkv(&mut rng, seq, width)?;

        // Warmup sizes the scratch pools.
        run_once(&mut npu, &qkv, kv_heads, head_dim)?;
        run_once(&mut cpu, &qkv, kv_heads, head_dim)?;
        let bucket = npu.last_decision().map(|d| d.bucket_size).unwrap_or(seq);

        let npu_s = time_it(iters, || run_once(&mut npu, &qkv, kv_heads, head_dim).map(drop))?;
        let cpu_s = time_it(iters, || run_once(&mut cpu, &qkv, kv_heads, head_dim).map(drop))?;

        println!(
            "{:<10} {:>8} {:>12.3}ms {:>12.3}ms {:>9.2}x",
            format!("seq={}", seq),
            bucket,
            npu_s * 1000.0,
            cpu_s * 1000.0,
            cpu_s / npu_s
        );
    }

    let stats = npu.pool_stats();
    println!(
        "\nScratch pool: {} allocations, {} grows, {} live bytes, {} reclaimed bytes",
        stats.allocations, stats.grows, stats.live_bytes, stats.reclaimed_bytes
    );
    Ok(())
}

/// Mean seconds per call over `iters` calls.
fn time_it<F: FnMut() -> Result<()>>(iters: usize, mut f: F) -> Result<f64> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}
