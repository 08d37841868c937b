use std::path::Path;
use std::time::Duration;

use reverse_prompt::store::count_by_status;
use reverse_prompt::{
    open_store, BatchConfig, BatchRunner, ImageSource, OllamaCaptioner, OllamaConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let images = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: basic_batch <image_dir> [store.csv|store.db] [model]");
        std::process::exit(1);
    });
    let store_path = std::env::args()
        .nth(2)
        .unwrap_or("reverse_prompts.csv".to_string());
    let model = std::env::args().nth(3).unwrap_or("llava".to_string());

    let captioner = OllamaCaptioner::new(
        OllamaConfig::with_model(&model).timeout(Duration::from_secs(120)),
    );
    let config = BatchConfig::builder()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_secs(2))
        .with_pace(Duration::from_millis(200))
        .build();
    let runner = BatchRunner::new(captioner, config)?;

    let records = ImageSource::directory(&images).discover()?;
    println!("Found {} image(s) under {}", records.len(), images);

    let mut store = open_store(Path::new(&store_path))?;
    let summary = runner.run(&records, store.as_mut()).await?;

    println!(
        "Run {}: {} done, {} failed, {} skipped, {} API call(s)",
        summary.run_id, summary.done, summary.failed, summary.skipped, summary.api_calls
    );
    for id in &summary.failed_ids {
        println!("  failed: {}", id);
    }

    // Running again only picks up what is not done yet.
    let entries = store.load()?;
    for (status, count) in count_by_status(&entries) {
        println!("  {:<12} {}", status, count);
    }

    Ok(())
}
