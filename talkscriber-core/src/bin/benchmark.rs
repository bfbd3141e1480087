//! Time-to-first-audio benchmark for the egress path.
//!
//! Runs the same speak request N times on one session and reports how long
//! each took to reach the first sink write.

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use serde::Serialize;
    use std::path::PathBuf;
    use talkscriber_core::{
        bridge::playback::CollectorSink, SinkTarget, SpeechClient, SpeechReport, TtsConfig,
    };

    const DEFAULT_TEXT: &str =
        "Hello from the Talkscriber benchmark. This sentence measures time to first audio.";

    #[derive(Debug)]
    struct Args {
        api_key: String,
        url: Option<String>,
        text: String,
        runs: usize,
        device: bool,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct RunResult {
        run: usize,
        ttfa_ms: Option<f64>,
        first_chunk_ms: Option<f64>,
        chunks: u64,
        duration_secs: f64,
        underruns: u64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        url: String,
        runs: usize,
        completed: usize,
        min_ms: f64,
        max_ms: f64,
        mean_ms: f64,
        p50_ms: f64,
        p95_ms: f64,
        p99_ms: f64,
        results: Vec<RunResult>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut api_key = std::env::var("TALKSCRIBER_API_KEY").ok();
        let mut url = None;
        let mut text = DEFAULT_TEXT.to_string();
        let mut runs = 5usize;
        let mut device = false;
        let mut output = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--api-key" => {
                    api_key = Some(it.next().ok_or("missing value for --api-key")?);
                }
                "--url" => {
                    url = Some(it.next().ok_or("missing value for --url")?);
                }
                "--text" => {
                    text = it.next().ok_or("missing value for --text")?;
                }
                "--runs" => {
                    let v = it.next().ok_or("missing value for --runs")?;
                    runs = v
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --runs".to_string())?
                        .clamp(1, 100);
                }
                "--device" => device = true,
                "--output" => {
                    output = Some(PathBuf::from(it.next().ok_or("missing value for --output")?));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p talkscriber-core --bin benchmark -- \\
  [--api-key <key>] [--url <wss://...>] [--text <text>] [--runs <n>] [--device] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        let api_key = api_key.ok_or("no API key: pass --api-key or set TALKSCRIBER_API_KEY")?;
        Ok(Args {
            api_key,
            url,
            text,
            runs,
            device,
            output,
        })
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn ms(d: Option<std::time::Duration>) -> Option<f64> {
        d.map(|d| d.as_secs_f64() * 1000.0)
    }

    let args = parse_args()?;
    let mut config = TtsConfig::new(args.api_key.clone());
    if let Some(url) = &args.url {
        config.session.url = url.clone();
    }
    let url = config.session.url.clone();
    let client = SpeechClient::new(config).map_err(|e| e.to_string())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    println!("Running TTFA benchmark against {url} (runs={})", args.runs);

    let results: Vec<RunResult> = runtime.block_on(async {
        let session = client.open().await.map_err(|e| e.to_string())?;
        let mut results = Vec::with_capacity(args.runs);
        for run in 1..=args.runs {
            let sink = if args.device {
                SinkTarget::Device { preferred: None }
            } else {
                let (collector, _store) = CollectorSink::new("benchmark", true);
                SinkTarget::Custom(Box::new(collector))
            };
            let report: SpeechReport = session
                .say(&args.text, vec![sink])
                .await
                .map_err(|e| format!("run {run}: {e}"))?;
            let result = RunResult {
                run,
                ttfa_ms: ms(report.time_to_first_audio),
                first_chunk_ms: ms(report.time_to_first_chunk),
                chunks: report.chunks,
                duration_secs: report.duration_secs,
                underruns: report.underruns,
            };
            match result.ttfa_ms {
                Some(ttfa) => println!(
                    "run {run}/{runs}: ttfa {ttfa:.1} ms, {chunks} chunks, {dur:.2}s audio",
                    runs = args.runs,
                    chunks = result.chunks,
                    dur = result.duration_secs
                ),
                None => println!("run {run}/{}: no audio", args.runs),
            }
            results.push(result);
        }
        session.close().await;
        Ok::<_, String>(results)
    })?;

    let ttfa: Vec<f64> = results.iter().filter_map(|r| r.ttfa_ms).collect();
    let summary = Summary {
        url,
        runs: args.runs,
        completed: ttfa.len(),
        min_ms: if ttfa.is_empty() {
            0.0
        } else {
            ttfa.iter().copied().fold(f64::INFINITY, f64::min)
        },
        max_ms: ttfa.iter().copied().fold(0.0, f64::max),
        mean_ms: if ttfa.is_empty() {
            0.0
        } else {
            ttfa.iter().sum::<f64>() / ttfa.len() as f64
        },
        p50_ms: percentile(&ttfa, 0.50),
        p95_ms: percentile(&ttfa, 0.95),
        p99_ms: percentile(&ttfa, 0.99),
        results,
    };

    println!(
        "Done. runs={} min={:.1}ms mean={:.1}ms p50={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
        summary.completed,
        summary.min_ms,
        summary.mean_ms,
        summary.p50_ms,
        summary.p95_ms,
        summary.p99_ms,
        summary.max_ms
    );

    if let Some(out) = args.output {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    }

    Ok(())
}
