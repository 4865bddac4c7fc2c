//! strata-replay: Run a batch of prompts against a scripted replay engine.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;

use strata_serve::cli;
use strata_serve::engine::{
    EngineConfig, EngineStats, GenerationConfig, Prompt, ReplayEngine, ReplayScript, ServeEngine,
};
use strata_serve::{ServeError, Tokenizer, VocabTokenizer};

#[derive(Parser)]
#[command(
    name = "strata-replay",
    about = "Replay a scripted engine event stream and print the decoded outputs"
)]
struct Args {
    /// Replay script (JSON): steps of stream event deliveries
    #[arg(short = 's', long)]
    script: PathBuf,

    /// Vocabulary file (JSON). Defaults to the engine config's tokenizer_path
    #[arg(short = 't', long)]
    tokenizer: Option<PathBuf>,

    /// Engine config (JSON)
    #[arg(long)]
    engine_config: Option<PathBuf>,

    /// Generation config (JSON), shared by every prompt
    #[arg(short = 'g', long)]
    config: Option<PathBuf>,

    /// Stop string (repeatable), added to the generation config
    #[arg(long = "stop")]
    stop: Vec<String>,

    /// Maximum tokens to generate per prompt
    #[arg(short = 'n', long)]
    max_tokens: Option<usize>,

    /// Prompt text (repeatable, one request each)
    #[arg(short = 'p', long = "prompt", conflicts_with_all = ["file", "token_ids"])]
    prompt: Vec<String>,

    /// Read prompts from file, one per line
    #[arg(short = 'f', long, conflicts_with = "token_ids")]
    file: Option<PathBuf>,

    /// Pre-tokenized prompt: comma-separated token IDs (repeatable)
    #[arg(long = "token-ids")]
    token_ids: Vec<String>,

    /// Read prompts from stdin, one per line
    #[arg(long, conflicts_with_all = ["prompt", "file", "token_ids"])]
    stdin: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Write a Chrome trace of request events to this path
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Report engine statistics
    #[arg(long)]
    stats: bool,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

#[derive(Serialize)]
struct PromptOutput {
    prompt: String,
    output: String,
    finish_reason: String,
}

#[derive(Serialize)]
struct JsonOutput {
    outputs: Vec<PromptOutput>,
    total_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<EngineStats>,
    config: GenerationConfig,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let engine_config = match &args.engine_config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let tokenizer_path = args
        .tokenizer
        .clone()
        .or_else(|| engine_config.tokenizer_path.clone())
        .ok_or_else(|| {
            ServeError::Config("no tokenizer: pass --tokenizer or set tokenizer_path".to_string())
        })?;
    let tokenizer: Arc<dyn Tokenizer> = Arc::new(VocabTokenizer::from_file(&tokenizer_path)?);

    let mut gen_config = match &args.config {
        Some(path) => GenerationConfig::from_file(path)?,
        None => GenerationConfig::default(),
    };
    gen_config.stop_strs.extend(args.stop.iter().cloned());
    if let Some(max_tokens) = args.max_tokens {
        gen_config.max_tokens = max_tokens;
    }

    let (prompts, displays): (Vec<Prompt>, Vec<String>) = if !args.token_ids.is_empty() {
        args.token_ids
            .iter()
            .map(|ids| -> Result<(Prompt, String), String> {
                let ids = cli::parse_token_ids(ids)?;
                let display = format!("[{} token IDs]", ids.len());
                Ok((Prompt::Tokens(ids), display))
            })
            .collect::<Result<Vec<_>, String>>()?
            .into_iter()
            .unzip()
    } else {
        cli::read_prompts(&args.prompt, args.file.as_deref(), args.stdin)?
            .into_iter()
            .map(|text| (Prompt::Text(text.clone()), text))
            .unzip()
    };

    let script = ReplayScript::from_file(&args.script)?;
    let tracing_enabled = args.trace.is_some() || engine_config.enable_tracing;
    let engine = ReplayEngine::new(engine_config, script).with_tokenizer(Arc::clone(&tokenizer));
    let mut serve = ServeEngine::new(engine, tokenizer);
    if tracing_enabled {
        serve.enable_tracing();
    }

    let start = Instant::now();
    let outputs = serve.generate_full(prompts, &gen_config)?;
    let total_ms = start.elapsed().as_secs_f64() * 1000.0;

    if let (Some(path), Some(recorder)) = (&args.trace, serve.trace_recorder()) {
        std::fs::write(path, recorder.dump_json()?)?;
        eprintln!("Wrote {} trace events to {}", recorder.len(), path.display());
    }

    let stats = if args.stats {
        Some(serve.stats()?)
    } else {
        None
    };

    match args.output_format.as_str() {
        "json" => {
            let json = JsonOutput {
                outputs: displays
                    .into_iter()
                    .zip(outputs)
                    .map(|(prompt, output)| PromptOutput {
                        prompt,
                        output: output.text,
                        finish_reason: output.finish_reason.to_string(),
                    })
                    .collect(),
                total_ms,
                stats,
                config: gen_config,
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            for output in &outputs {
                println!("{}", output.text);
            }
            if let Some(stats) = stats {
                eprintln!(
                    "prefill: {} tokens in {:.3}s, decode: {} tokens in {:.3}s ({:.1} tok/s)",
                    stats.total_prefill_tokens,
                    stats.engine_total_prefill_time,
                    stats.total_decode_tokens,
                    stats.engine_total_decode_time,
                    stats.decode_tokens_per_sec()
                );
            }
        }
    }

    Ok(())
}
