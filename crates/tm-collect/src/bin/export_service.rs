use tm_collect::Settings;
use tm_data::{KlineStore, SequenceExporter, DEFAULT_SEQUENCE_LENGTH};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Offline export: reads every configured pair from the database and writes
/// one Parquet file of training windows per pair.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;
    let out_dir = std::env::var("TIDEMARK_EXPORT_DIR").unwrap_or_else(|_| ".".to_string());
    let sequence_length = match std::env::var("TIDEMARK_SEQ_LEN") {
        Ok(raw) => raw.parse::<usize>()?,
        Err(_) => DEFAULT_SEQUENCE_LENGTH,
    };

    let store = KlineStore::open(&settings.db_path)?;
    let exporter = SequenceExporter::new(store).with_sequence_length(sequence_length);

    for (symbol, interval) in &settings.pairs {
        let path = std::path::Path::new(&out_dir)
            .join(format!("{}_{}_windows.parquet", symbol, interval.token()));
        let written = exporter.export_parquet(symbol, interval, &path)?;
        info!(
            symbol = %symbol,
            interval = %interval,
            windows = written,
            path = %path.display(),
            "export complete"
        );
    }

    Ok(())
}
