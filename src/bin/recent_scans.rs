//! recent_scans - print the most recent scan records from the kiosk store

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};

use agrovision_kiosk::{ScanRecord, ScanStore, SqliteScanStore};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the scan database.
    #[arg(long, env = "AGROVISION_DB_PATH", default_value = "agrovision.db")]
    db_path: String,
    /// Maximum number of records to print.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Print only the record for this episode key.
    #[arg(long)]
    episode: Option<String>,
    /// Output format.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = SqliteScanStore::open(&args.db_path)?;

    let records = match &args.episode {
        Some(key) => match store.get_by_episode(key)? {
            Some(record) => vec![record],
            None => return Err(anyhow!("no scan stored for episode {}", key)),
        },
        None => store.recent(args.limit)?,
    };

    match args.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Format::Text => {
            if records.is_empty() {
                println!("no scans stored in {}", args.db_path);
            }
            for record in &records {
                println!("{}", render(record));
            }
        }
    }
    Ok(())
}

fn render(record: &ScanRecord) -> String {
    let scan = &record.scan;
    let mut line = format!(
        "#{:<5} {:<24} conf={:.2} frame={} at={}",
        record.id, scan.item_label, scan.item_confidence, scan.source_frame_seq, scan.detected_at
    );
    if !scan.extracted_text.is_empty() {
        line.push_str(&format!(" text={:?}", scan.extracted_text));
    }
    if let Some(m) = &scan.catalog_match {
        line.push_str(&format!(" product={} ({:?} {:.2})", m.product_id, m.kind, m.score));
    }
    line
}
