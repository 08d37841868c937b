use std::path::Path;

use reverse_prompt::{prepare, CaptionComposer, CaptionRules, PrepareOptions, TermDictionary};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let input_csv = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: prepare_dataset <metadata.csv> <images_dir> <out_dir> [terms.json]");
        std::process::exit(1);
    });
    let images = std::env::args().nth(2).unwrap_or("./dataset/images".to_string());
    let out = std::env::args().nth(3).unwrap_or("./training_data".to_string());

    let dictionary = match std::env::args().nth(4) {
        Some(path) => TermDictionary::load(Path::new(&path))?,
        None => TermDictionary::from_json(
            r#"{
                "Stone ocean": [1.75, ["stone_ocean", "petrified sea"]],
                "Glacier": [1.3, ["ice sheet"]]
            }"#,
        )?,
    };

    let rules = CaptionRules {
        trigger_word: Some("sslq style".to_string()),
        ..CaptionRules::default()
    };
    let composer = CaptionComposer::new(rules, dictionary)?;

    let mut options = PrepareOptions::new(&input_csv, &images, &out);
    options.min_style = 2.0;
    options.min_quality = 2.0;
    options.extra_filters = vec![(
        "category".to_string(),
        vec!["landscape".to_string(), "seascape".to_string()],
    )];
    // Look before writing anything.
    options.dry_run = true;

    let report = prepare(&options, &composer)?;
    println!("{}", serde_json::to_string_pretty(&report.counts)?);
    for example in &report.examples {
        println!("{} -> {}", example.source_img.display(), example.out_txt.display());
        println!("  {}", example.description_preview);
    }

    Ok(())
}
