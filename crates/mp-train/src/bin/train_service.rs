use mp_data::LocalArrayStore;
use mp_train::{run_search, TrainSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = TrainSettings::from_env()?;
    info!(
        "Searching {} trials over {} / {} in {}",
        settings.num_samples,
        settings.features_path,
        settings.target_path,
        settings.data_root.display()
    );

    let store = LocalArrayStore::new(&settings.data_root);
    let outcome = run_search(&settings, &store).await?;

    println!("{}", serde_json::to_string_pretty(&outcome.best)?);
    Ok(())
}
