use plugin_bridge::app::parse_test_args;
use plugin_bridge::config::{HarnessConfig, SelectPolicy};
use plugin_bridge::harness::{self, HarnessOptions};
use std::time::Duration;

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let select_none = std::env::args().any(|a| a == "--select-none");
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|a| !a.starts_with("--"))
        .collect();
    let (url, media) = parse_test_args(&args)?;

    let mut options = HarnessOptions::from(&HarnessConfig::default())
        .on_progress(|percent| println!("<- progress {percent}%"));
    if select_none {
        options.select = SelectPolicy::None;
    }
    if options.timeout.is_none() {
        options.timeout = Some(Duration::from_secs(120));
    }

    println!("bridge-test-client: connecting to {url}");
    println!("-> stream {}", media.describe());
    match harness::run_test(&url, &media, options).await? {
        Some(link) => {
            println!("<- result");
            println!("{}", serde_json::to_string_pretty(&link)?);
        }
        None => println!("<- no result"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
