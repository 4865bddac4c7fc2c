//! Shared CLI utilities for strata-serve binary tools.

use std::io::Read;
use std::path::Path;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read a batch of prompts from one of: prompt strings, file path, or stdin.
///
/// A file or stdin holds one prompt per line; blank lines are skipped.
/// Returns an error message string if no input source is provided.
pub fn read_prompts(
    prompts: &[String],
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<Vec<String>, String> {
    if !prompts.is_empty() {
        return Ok(prompts.to_vec());
    }

    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e))?;
        return Ok(split_prompts(&text));
    }

    if use_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        return Ok(split_prompts(&buf));
    }

    Err("No input provided. Use --prompt, --file, --token-ids or --stdin".to_string())
}

fn split_prompts(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a pre-tokenized prompt: comma-separated token IDs.
pub fn parse_token_ids(ids: &str) -> Result<Vec<u32>, String> {
    ids.split(',')
        .map(|s| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| format!("Invalid token ID: '{}'", s.trim()))
        })
        .collect()
}
