//! Validate a resilience config file and print the effective per-service policy.
//! Used by CI and before deploys.
//!
//! Usage: `validate-config [PATH]` (falls back to `INGEST_RESILIENCE_CONFIG`).

use ingest_resilience::config::{ResilienceConfig, CONFIG_ENV};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .ok_or_else(|| anyhow::anyhow!("usage: validate-config <PATH> (or set {})", CONFIG_ENV))?;

    println!("Validating {}", path);
    let config = match ResilienceConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let pipeline = config.pipeline_config();
    println!("\n=== Pipeline ===");
    println!(
        "fan_out={} batch_size={} cancel_grace={}ms deadline={} chunk={}/{} trigger_ingestion={}",
        pipeline.fan_out,
        pipeline.batch_size,
        config.pipeline.cancel_grace_ms,
        pipeline
            .run_deadline
            .map(|d| format!("{}ms", d.as_millis()))
            .unwrap_or_else(|| "none".to_string()),
        config.pipeline.chunk_size,
        config.pipeline.chunk_overlap,
        pipeline.trigger_ingestion,
    );

    println!("\n=== Services ===");
    for (name, policy) in config.effective_policies() {
        let source = if config.services.contains_key(&name) {
            "configured"
        } else {
            "preset"
        };
        println!("{:<14} [{}] {}", name, source, policy.describe());
    }

    println!("\n✅ Config is valid");
    Ok(())
}
