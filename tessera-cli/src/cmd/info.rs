//! `tessera info` -- build and configuration summary.

use anyhow::Result;
use tessera_core::{TaskKind, WorkerConfig};

pub fn execute(config: &WorkerConfig) -> Result<()> {
    println!("Tessera v{}", tessera_core::VERSION);
    println!();

    let device = tessera_core::default_device()?;
    println!("Device:   {device:?}");
    println!("Backends: {}", tessera_core::backends().join(", "));
    println!();

    println!("Tasks");
    println!("-----");
    for task in TaskKind::ALL {
        let source = config
            .sources
            .get(&task)
            .map(ToString::to_string)
            .unwrap_or_else(|| "(not registered)".to_string());
        println!("  {:<26} {source}", task.as_str());
    }
    println!();
    println!("Stream buffer:          {}", config.stream_buffer);
    println!("Default max new tokens: {}", config.default_max_new_tokens);
    println!("Report failures:        {}", config.report_failures);

    Ok(())
}
